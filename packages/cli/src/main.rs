use anyhow::Context;
use std::sync::Arc;
use zwire_driver::{Driver, DriverOptions, Notification};
use zwire_logging::{ConsoleSink, Loglevel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    let options = DriverOptions::builder()
        .log_sink(Arc::new(ConsoleSink::new(Loglevel::Debug)))
        .build();

    let driver = Driver::open(&path, options)
        .with_context(|| format!("failed to open {}", path))?;

    driver.add_watcher(Arc::new(|notification: &Notification| {
        match notification {
            Notification::DriverReady { home_id, node_id } => {
                println!("driver ready: home {:#010x}, controller node {}", home_id, node_id);
            }
            Notification::DriverFailed => println!("driver failed, giving up"),
            Notification::AllNodesQueried => println!("every node has been interviewed"),
            other => println!("{:?}", other),
        }
    }));

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    driver.shutdown();

    Ok(())
}
