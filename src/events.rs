use crate::error::SkipReason;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Observability events emitted at pipeline boundaries.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    FetchComplete {
        tickers: usize,
        observations: usize,
    },
    ReturnsEstimated {
        rows: usize,
        assets: usize,
    },
    PointSolved {
        target_return: f64,
        std_dev: f64,
        iterations: usize,
    },
    PointSkipped {
        target_return: f64,
        reason: SkipReason,
    },
    FrontierComplete {
        solved: usize,
        skipped: usize,
    },
    SelectionMade {
        target_return: f64,
        sharpe_ratio: f64,
    },
}

/// Receives pipeline events. Implementations must tolerate calls from rayon workers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Forwards events to `tracing` as structured fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::FetchComplete { tickers, observations } => {
                info!(tickers, observations, "Price history fetched");
            }
            PipelineEvent::ReturnsEstimated { rows, assets } => {
                info!(rows, assets, "Return statistics estimated");
            }
            PipelineEvent::PointSolved {
                target_return,
                std_dev,
                iterations,
            } => {
                debug!(target_return, std_dev, iterations, "Frontier point solved");
            }
            PipelineEvent::PointSkipped { target_return, reason } => {
                warn!(target_return, reason = %reason, "Frontier point skipped");
            }
            PipelineEvent::FrontierComplete { solved, skipped } => {
                info!(solved, skipped, "Efficient frontier complete");
            }
            PipelineEvent::SelectionMade {
                target_return,
                sharpe_ratio,
            } => {
                info!(target_return, sharpe_ratio, "Max-Sharpe portfolio selected");
            }
        }
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
    }
}
