//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use grace_server::config::schema::ServerConfig;
use grace_server::lifecycle::{LaunchSpec, ServerRegistry, StartupError, Supervisor};
use grace_server::net::{Inheritance, ServerStream, TrackedConnection};
use grace_server::GraceConfig;

/// A loopback address nothing is listening on right now.
pub async fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn config(addresses: &[String]) -> GraceConfig {
    GraceConfig {
        servers: addresses
            .iter()
            .map(|address| ServerConfig {
                address: address.clone(),
                tls: None,
            })
            .collect(),
        ..Default::default()
    }
}

/// Holds each connection until the client hangs up.
pub async fn hold_until_eof(mut conn: TrackedConnection<ServerStream>) -> io::Result<()> {
    let mut buf = [0u8; 64];
    while conn.read(&mut buf).await? > 0 {}
    conn.close().await
}

/// A supervisor running in the background with the `hold_until_eof` handler.
pub struct Running {
    pub registry: Arc<ServerRegistry>,
    pub task: JoinHandle<Result<(), StartupError>>,
}

pub async fn start(config: GraceConfig, launch: LaunchSpec) -> Running {
    let expected = config.servers.len();
    let supervisor = Supervisor::new(config, Inheritance::root(), launch);
    let registry = supervisor.registry();
    let task = tokio::spawn(supervisor.run(Arc::new(hold_until_eof)));

    wait_until(Duration::from_secs(5), || registry.len() == expected).await;
    Running { registry, task }
}

/// Launch settings that never get used.
pub fn no_launch() -> LaunchSpec {
    LaunchSpec {
        program: "/bin/false".into(),
        args: Vec::new(),
    }
}

/// Launch `/bin/sh <script> <args...>`, so the written script is never exec'd directly.
pub fn sh_launch(script: &Path, args: &[&str]) -> LaunchSpec {
    let mut all = vec![script.as_os_str().to_owned()];
    all.extend(args.iter().map(Into::into));
    LaunchSpec {
        program: "/bin/sh".into(),
        args: all,
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

/// Poll `cond` until it holds, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Like [`wait_until`] for async conditions.
pub async fn wait_until_async<F, Fut>(limit: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
