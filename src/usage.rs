//! Token usage accounting.
//!
//! The response engine reports per-call token counts over a fire-and-forget
//! channel; a single reporter task accumulates daily and monthly totals and
//! logs a cost estimate on a fixed period.

use std::time::Duration;

use chrono::{Datelike, Utc};
use tokio::task::JoinHandle;

/// USD per 1M tokens (gemini-2.5-flash tier, thinking billed as output).
const INPUT_PRICE_PER_M: f64 = 0.15;
const OUTPUT_PRICE_PER_M: f64 = 3.50;
const THINKING_PRICE_PER_M: f64 = 3.50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub thinking: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.thinking += other.thinking;
    }

    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }

    pub fn cost_usd(&self) -> f64 {
        (self.input as f64 / 1_000_000.0) * INPUT_PRICE_PER_M
            + (self.output as f64 / 1_000_000.0) * OUTPUT_PRICE_PER_M
            + (self.thinking as f64 / 1_000_000.0) * THINKING_PRICE_PER_M
    }
}

fn format_report(label: &str, usage: &TokenUsage) -> String {
    format!(
        "{}: in={} out={} think={} ~${:.4}",
        label,
        usage.input,
        usage.output,
        usage.thinking,
        usage.cost_usd()
    )
}

/// Spawn the reporter. Daily totals are logged and reset every `period`;
/// monthly totals reset on month rollover. When every sender is gone the task
/// logs a final report and exits, so it also winds down naturally on shutdown.
pub fn spawn_usage_reporter(
    rx: flume::Receiver<TokenUsage>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut daily = TokenUsage::default();
        let mut monthly = TokenUsage::default();
        let mut current_month = Utc::now().month();

        let mut tick = tokio::time::interval(period);
        tick.tick().await; // interval fires immediately; skip that one

        loop {
            tokio::select! {
                received = rx.recv_async() => match received {
                    Ok(usage) => {
                        daily.add(usage);
                        monthly.add(usage);
                    }
                    Err(_) => break,
                },
                _ = tick.tick() => {
                    tracing::info!("{}", format_report("Tokens spent today", &daily));
                    tracing::info!("{}", format_report("Tokens spent this month", &monthly));
                    daily = TokenUsage::default();

                    let month = Utc::now().month();
                    if month != current_month {
                        current_month = month;
                        monthly = TokenUsage::default();
                    }
                }
            }
        }

        if !monthly.is_empty() {
            tracing::info!("{}", format_report("Tokens spent, final", &monthly));
        }
    })
}
