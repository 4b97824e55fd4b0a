use std::error::Error;

use tradedash_stream::stream::client::{ConnectionState, StreamClient};
use tradedash_stream::stream::proto::StreamUpdate;
use tracing_subscriber::EnvFilter;

fn print_update(update: &StreamUpdate) {
    if update.is_error() {
        println!("server error: {}", update.message.as_deref().unwrap_or("unknown"));
        return;
    }
    let Some(data) = update.data.as_ref() else {
        return;
    };
    if let Some(stats) = &data.stats {
        println!(
            "trades={} bought={} sold={} realized_pl={:.2}",
            stats.total_trades, stats.bought_trades, stats.sold_trades, stats.realized_pl,
        );
    }
    for entry in data.ticker_pl.iter().flatten() {
        println!("ticker={} pl={:.2}", entry.ticker, entry.pl);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Reads TRADEDASH_API_URL, falling back to the local backend.
        let client = StreamClient::new()?;
        println!("stream_url={}", client.stream_url());

        let _subscription = client.subscribe(print_update);
        let mut state = client.watch_state();
        loop {
            let current = state.borrow_and_update().clone();
            println!("state={current:?}");
            if current == ConnectionState::Closed {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
