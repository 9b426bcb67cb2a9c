// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for connection string parsing.

#![no_main]

use broadcast_bus::ConnectionDescriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    if let Ok(d) = ConnectionDescriptor::parse(input) {
        assert!(!d.host.is_empty());
        assert!(d.port != 0);

        // Rendering never panics and never leaks the password
        let shown = d.to_string();
        let _ = d.database_url();
        if let Some(ref pw) = d.password {
            if pw.len() > 3 && !d.host.contains(pw.as_str()) && !d.user.as_deref().unwrap_or("").contains(pw.as_str()) {
                assert!(!shown.contains(&format!(":{}@", pw)));
            }
        }
    }
});
