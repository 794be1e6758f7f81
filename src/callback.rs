//! Hooks into the training loop.

use std::io::{self, Stdout, Write};
use std::time::Duration;

use tracing::warn;

use crate::trainer::{FitReport, StepRecord};

/// Summary handed to [`Callback::on_epoch_end`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpochLogs {
    /// Epochs completed so far, counting this one.
    pub epoch: usize,
    pub max_epochs: usize,
    pub step: usize,
    pub train_loss: f64,
    pub test_loss: Option<f64>,
    pub learning_rate: f64,
    pub elapsed: Duration,
}

/// Every hook defaults to doing nothing.
pub trait Callback {
    fn on_train_begin(&mut self, _num_params: usize) {}

    /// Runs after every successful optimizer step, before the next one starts.
    fn on_step(&mut self, _record: &StepRecord) {}

    fn on_epoch_end(&mut self, _logs: &EpochLogs) {}

    /// Only reached when `fit` returns a report.
    fn on_train_end(&mut self, _report: &FitReport) {}
}

/// Writes one progress line per epoch.
pub struct PrintTrainingLoss<W: Write = Stdout> {
    out: W,
}

impl PrintTrainingLoss {
    pub fn new() -> Self {
        PrintTrainingLoss { out: io::stdout() }
    }
}

impl Default for PrintTrainingLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> PrintTrainingLoss<W> {
    pub fn to_writer(out: W) -> Self {
        PrintTrainingLoss { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: std::fmt::Arguments) {
        if let Err(err) = self.out.write_fmt(line).and_then(|_| self.out.flush()) {
            warn!(%err, "could not write training progress");
        }
    }
}

impl<W: Write> Callback for PrintTrainingLoss<W> {
    fn on_train_begin(&mut self, num_params: usize) {
        self.emit(format_args!("training {num_params} parameters\n"));
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs) {
        let test = logs
            .test_loss
            .map(|loss| format!("  test loss {loss:.4e}"))
            .unwrap_or_default();
        self.emit(format_args!(
            "epoch {}/{}  step {}  train loss {:.4e}{test}  lr {:.2e}  {:.2?}\n",
            logs.epoch, logs.max_epochs, logs.step, logs.train_loss, logs.learning_rate, logs.elapsed
        ));
    }

    fn on_train_end(&mut self, report: &FitReport) {
        self.emit(format_args!(
            "stopped after {} epochs: {:?}\n",
            report.epochs, report.reason
        ));
    }
}
