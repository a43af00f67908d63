//! Simple example of dispatching through a rotating proxy pool.

use reqwest::Method;
use rotating_fetch::{init_pool, Dispatcher, PoolConfig, RequestOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = PoolConfig::builder()
        .config_path("proxy_config.txt")
        .auto_refresh(true)
        .min_working(5)
        .health_check_url("http://httpbin.org/ip")
        .health_check_timeout(Duration::from_secs(5))
        .build();

    let pool = init_pool(config).await;
    let stats = pool.stats();
    println!(
        "Pool ready: {} proxies ({} available, {} blacklisted)",
        stats.total, stats.available, stats.blacklisted
    );

    let dispatcher = Dispatcher::new(pool);

    println!("Sending request...");
    let response = dispatcher
        .dispatch(
            Method::GET,
            "https://httpbin.org/ip",
            3,
            true,
            &RequestOptions::default(),
        )
        .await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text());

    Ok(())
}
