/// Statistics extraction from residual controller and receiver output.
///
/// A plain substring filter: any line containing one of the configured
/// markers is surfaced verbatim, everything else is discarded.
use crate::process::ManagedProcess;
use std::time::Duration;

pub struct StatisticsExtractor {
    markers: Vec<String>,
}

impl StatisticsExtractor {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }

    /// Lines of `output` containing a marker, in original order.
    pub fn extract<'a>(&self, output: &'a str) -> Vec<&'a str> {
        output
            .lines()
            .filter(|line| self.markers.iter().any(|m| line.contains(m.as_str())))
            .collect()
    }

    /// Drain what `process` has left on stdout and extract the marker lines.
    pub async fn collect(&self, process: &mut ManagedProcess, timeout: Duration) -> Vec<String> {
        let output = process.drain_remaining_output(timeout).await;
        let found: Vec<String> = self
            .extract(&output)
            .into_iter()
            .map(str::to_string)
            .collect();
        tracing::debug!(
            label = %process.label(),
            found = found.len(),
            "scanned residual output for statistics"
        );
        found
    }
}
