/// Stops training when a maximised validation metric stalls.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    pub best_metric: f32,
    counter: usize,
    pub stopped: bool,
}

impl EarlyStopping {
    /// `patience == 0` never stops.
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_metric: f32::NEG_INFINITY,
            counter: 0,
            stopped: false,
        }
    }

    /// Continue from a known best value (after resuming).
    pub fn with_best(mut self, best_metric: Option<f32>) -> Self {
        if let Some(best) = best_metric {
            self.best_metric = best;
        }
        self
    }

    pub fn enabled(&self) -> bool {
        self.patience > 0
    }

    pub fn should_stop(&mut self, current: f32) -> bool {
        if self.stopped {
            return true;
        }

        if current > self.best_metric + self.min_delta {
            self.best_metric = current;
            self.counter = 0;
            return false;
        }

        self.counter += 1;
        if self.enabled() && self.counter >= self.patience {
            self.stopped = true;
            log::info!(
                "early stopping: no improvement for {} validations (best {:.4})",
                self.patience,
                self.best_metric
            );
        }
        self.stopped
    }

    pub fn reset(&mut self) {
        self.best_metric = f32::NEG_INFINITY;
        self.counter = 0;
        self.stopped = false;
    }
}
