//! Trade pipeline demo: one producer publishes priced trade transactions,
//! one consumer assigns IDs and records them, mirroring the classic
//! single-producer/single-consumer setup this engine grew out of.
//!
//! Run with `cargo run --example trade_pipeline`.

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use ringline::{Engine, ProducerMode, YieldingWaitStrategy};

const BUFFER_SIZE: usize = 1024;
const TRADES: i64 = 1000;

#[derive(Debug, Default)]
struct TradeTransaction {
    id: Option<Uuid>,
    price: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut engine = Engine::new(
        TradeTransaction::default,
        BUFFER_SIZE,
        ProducerMode::Single,
        YieldingWaitStrategy::new(),
    )
    .context("constructing engine")?
    .handle_events_with(|trade: &mut TradeTransaction, sequence: i64, end_of_batch: bool| {
        // Persisting would happen here; assigning the ID stands in for it.
        trade.id = Some(Uuid::new_v4());
        info!(
            sequence,
            end_of_batch,
            price = trade.price,
            id = %trade.id.expect("just assigned"),
            "trade recorded"
        );
        Ok(())
    })
    .build();

    engine.start().context("starting engine")?;

    let mut producer = engine.producer().context("creating producer")?;
    for n in 0..TRADES {
        producer.publish(|trade| {
            trade.id = None;
            trade.price = (n as f64) * 0.9999;
        });
    }

    engine.drain();
    engine.shutdown().context("shutting down engine")?;
    info!(trades = TRADES, "pipeline complete");
    Ok(())
}
