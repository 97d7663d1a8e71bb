//! Per-operation timing published through the `metrics` facade.

use std::time::Instant;

/// Records the elapsed time of one driver operation when dropped.
///
/// Published as the histogram `physical.operation.seconds` with `driver` and
/// `op` labels.
#[must_use = "the timer records on drop"]
pub struct OpTimer {
    driver: &'static str,
    op: &'static str,
    start: Instant,
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        ::metrics::histogram!(
            "physical.operation.seconds",
            "driver" => self.driver,
            "op" => self.op
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// Start timing `op` on `driver`.
pub fn measure(driver: &'static str, op: &'static str) -> OpTimer {
    OpTimer {
        driver,
        op,
        start: Instant::now(),
    }
}
