// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use meterd_rs::api::session::HttpSessionProvider;
use tokio::{
    sync::Barrier,
    time::{Instant, sleep},
};

/// Two tasks contending for the same key: the second blocks until the
/// first returns the handle, then receives the same client instance.
#[tokio::test]
async fn same_key_blocks_second_caller() -> Result<()> {
    let provider = HttpSessionProvider::global();
    let barrier = Arc::new(Barrier::new(2));

    let first = provider.get("test-mutex-key").await?;
    let first_client = format!("{:p}", first.client());
    assert!(provider.in_use("test-mutex-key"));

    let waiter = {
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            let started = Instant::now();
            let handle = HttpSessionProvider::global()
                .get("test-mutex-key")
                .await
                .expect("second get");
            let waited = started.elapsed();
            let client = format!("{:p}", handle.client());
            drop(handle);
            (waited, client)
        })
    };

    barrier.wait().await;
    sleep(Duration::from_millis(50)).await;
    drop(first);

    let (waited, second_client) = waiter.await?;
    assert!(
        waited >= Duration::from_millis(45),
        "second caller returned after {waited:?} without blocking"
    );
    assert_eq!(first_client, second_client, "handles must be pooled");

    assert!(!provider.in_use("test-mutex-key"));
    Ok(())
}

/// Handles for distinct keys never block each other.
#[tokio::test]
async fn distinct_keys_run_in_parallel() -> Result<()> {
    let provider = HttpSessionProvider::global();

    let a = provider.get("test-key-a").await?;
    // would deadlock if keys shared one lock
    let b = tokio::time::timeout(
        Duration::from_millis(200),
        provider.get("test-key-b"),
    )
    .await
    .expect("no cross-key blocking")?;

    assert!(provider.in_use("test-key-a"));
    assert!(provider.in_use("test-key-b"));
    drop(a);
    drop(b);
    assert!(!provider.in_use("test-key-a"));
    assert!(!provider.in_use("test-key-b"));
    Ok(())
}
