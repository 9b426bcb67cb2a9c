// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for the change feed decoder.
//!
//! Arbitrary bytes split at an arbitrary point must never panic, and the
//! buffered partial record must stay within the configured bound.

#![no_main]

use broadcast_bus::framing::FrameDecoder;
use libfuzzer_sys::fuzz_target;

const MAX_RECORD: usize = 4096;

fuzz_target!(|data: (u16, &[u8])| {
    let (split, bytes) = data;
    let split = (split as usize).min(bytes.len());

    let mut decoder = FrameDecoder::new(MAX_RECORD, 3);
    for chunk in [&bytes[..split], &bytes[split..]] {
        match decoder.decode(chunk) {
            Ok(_) => assert!(decoder.buffered_len() <= MAX_RECORD),
            // Session would be torn down here
            Err(_) => return,
        }
    }
});
