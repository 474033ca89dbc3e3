//! End-to-end coverage of the bounded connection pool against an in-process
//! fake server: eager `minsize` fill, `maxsize` saturation with FIFO
//! waiter fairness, age-based recycling, and graceful shutdown.

mod support;

use std::sync::Arc;
use std::time::Duration;

use myaio::tokio::{Pool, PoolConfig};

use support::spawn_pool_server;

#[tokio::test]
async fn minsize_is_filled_eagerly() {
    let server = spawn_pool_server().await;
    let config = PoolConfig { minsize: 2, maxsize: 5, echo: false, pool_recycle: None };
    let pool = Pool::new(server.opts(), config).await.expect("pool");

    assert_eq!(pool.size().await, 2);
    assert_eq!(pool.freesize().await, 2);
}

#[tokio::test]
async fn acquire_and_release_returns_connection_to_free_list() {
    let server = spawn_pool_server().await;
    let config = PoolConfig { minsize: 0, maxsize: 3, echo: false, pool_recycle: None };
    let pool = Pool::new(server.opts(), config).await.expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    assert_eq!(pool.size().await, 1);
    assert_eq!(pool.freesize().await, 0);

    drop(conn);
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(pool.size().await, 1);
    assert_eq!(pool.freesize().await, 1);
}

#[tokio::test]
async fn waiter_is_served_fifo_once_maxsize_connection_is_released() {
    let server = spawn_pool_server().await;
    let config = PoolConfig { minsize: 0, maxsize: 1, echo: false, pool_recycle: None };
    let pool = Pool::new(server.opts(), config).await.expect("pool");

    let first = pool.acquire().await.expect("first acquire");
    assert_eq!(pool.size().await, 1);

    let pool_for_waiter = Arc::clone(&pool);
    let waiter = tokio::spawn(async move {
        let conn = pool_for_waiter.acquire().await.expect("waiter acquire");
        drop(conn);
    });

    // Give the waiter a chance to block on acquire() before the slot frees up.
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(first);
    tokio::time::timeout(Duration::from_secs(2), waiter).await.expect("waiter timed out").expect("waiter task panicked");

    // At most one physical connection ever existed for maxsize = 1.
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn stale_connection_is_recycled_past_pool_recycle_age() {
    let server = spawn_pool_server().await;
    let config = PoolConfig { minsize: 0, maxsize: 2, echo: false, pool_recycle: Some(Duration::from_millis(20)) };
    let pool = Pool::new(server.opts(), config).await.expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    drop(conn);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.freesize().await, 1);

    // Past pool_recycle: acquire must discard the stale idle connection and
    // open a fresh one rather than error out.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let conn = pool.acquire().await.expect("acquire after recycle");
    assert_eq!(pool.size().await, 1);
    drop(conn);
}

#[tokio::test]
async fn close_stops_new_acquires_and_drains_free_connections() {
    let server = spawn_pool_server().await;
    let config = PoolConfig { minsize: 2, maxsize: 4, echo: false, pool_recycle: None };
    let pool = Pool::new(server.opts(), config).await.expect("pool");
    assert_eq!(pool.size().await, 2);

    pool.close().await;
    pool.wait_closed().await;
    assert_eq!(pool.size().await, 0);

    let err = pool.acquire().await.expect_err("closed pool should refuse new acquires");
    assert!(matches!(err, myaio::Error::Interface(_)));
}
