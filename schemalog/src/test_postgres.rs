#![allow(dead_code)]

//! Shared PostgreSQL container for integration tests.
//!
//! One container serves the whole test run; every test gets its own database.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Mapped port of the shared container, set once it is running
static POSTGRES_PORT: AtomicU16 = AtomicU16::new(0);

static POSTGRES_INIT: Once = Once::new();

/// Runtime owning the container; kept alive for the rest of the test run
static mut TOKIO_RT: Option<tokio::runtime::Runtime> = None;

/// Default credentials of the testcontainers-modules image
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

fn ensure_postgres_started() {
    POSTGRES_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

        let port = rt.block_on(async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");

            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get postgres port");

            // Keep the container running after this scope
            std::mem::forget(container);

            port
        });

        POSTGRES_PORT.store(port, Ordering::SeqCst);

        // Safety: only ever written here, once, via Once::call_once
        unsafe {
            TOKIO_RT = Some(rt);
        }
    });
}

fn url_with_db(db: &str) -> String {
    ensure_postgres_started();
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        POSTGRES_PORT.load(Ordering::SeqCst),
        db
    )
}

/// Open another session on an existing test database.
pub fn connect_to(db_name: &str) -> Client {
    Client::connect(&url_with_db(db_name), NoTls).expect("failed to connect to test database")
}

/// Create an isolated database and connect to it. Returns the client and the database name.
pub fn fresh_postgres_db() -> (Client, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", db_name))
        .expect("failed to create test database");
    drop(admin);

    (connect_to(&db_name), db_name)
}

/// A client connected to a fresh, isolated database.
pub fn get_test_client() -> Client {
    let (client, _db_name) = fresh_postgres_db();
    client
}
