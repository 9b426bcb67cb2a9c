// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for CouchDB.

use broadcast_bus::{BusConfig, ConnectionDescriptor, CouchStore, StoreConfig};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const COUCH_USER: &str = "admin";
pub const COUCH_PASSWORD: &str = "password";

/// Single-node CouchDB 3 with an admin account.
///
/// Waits for the "has started" notice, which CouchDB logs to stderr.
pub fn couchdb_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("couchdb", "3")
        .with_exposed_port(5984)
        .with_env_var("COUCHDB_USER", COUCH_USER)
        .with_env_var("COUCHDB_PASSWORD", COUCH_PASSWORD)
        .with_wait_for(WaitFor::message_on_stderr("Apache CouchDB has started"));
    docker.run(image)
}

/// Connection string for `database` on the container.
pub fn couchdb_url(container: &Container<'_, GenericImage>, database: &str) -> String {
    let port = container.get_host_port_ipv4(5984);
    format!(
        "http://{}:{}@127.0.0.1:{}/{}",
        COUCH_USER, COUCH_PASSWORD, port, database
    )
}

/// A running CouchDB plus a database ready for the bus.
pub struct TestCouch<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestCouch<'a> {
    /// Start CouchDB and create `database`.
    pub async fn new(docker: &'a Cli, database: &str) -> Self {
        let container = couchdb_container(docker);
        let url = couchdb_url(&container, database);

        let descriptor = ConnectionDescriptor::parse(&url).expect("valid url");
        let store = CouchStore::new(descriptor, &StoreConfig::default()).expect("client");
        store.ensure_database().await.expect("create database");

        Self { container, url }
    }

    /// Bus config for one replica against this database.
    pub fn config(&self, origin: &str) -> BusConfig {
        BusConfig {
            connection: self.url.clone(),
            ..BusConfig::for_testing(origin)
        }
    }
}
