use crate::parsers::{parse_cpu_line, parse_gpu_table, parse_memory_block};
use crate::session::CommandRunner;
use crate::status::HostStatus;
use thiserror::Error;
use tracing::warn;

/// The three diagnostic commands, issued in this order every cycle.
/// GPU info is the most expensive and most interesting, so it goes
/// first.
pub const GPU_COMMAND: &str =
    "nvidia-smi --query-gpu=name,memory.used,memory.total --format=csv";
pub const CPU_COMMAND: &str = "top -bn1 | grep 'Cpu(s)'";
pub const MEMORY_COMMAND: &str = "free -m";

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("all metrics failed for host '{host}': {reason}")]
    AllMetricsFailed { host: String, reason: String },
}

/// Produces one [`HostStatus`] per cycle for one host by running the
/// three fixed commands over its session and parsing the output.
pub struct HostCollector<R> {
    name: String,
    runner: R,
}

impl<R: CommandRunner> HostCollector<R> {
    pub fn new(name: String, runner: R) -> Self {
        Self { name, runner }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn close(&mut self) {
        self.runner.close();
    }

    /// Best-effort per metric: a command or parse failure is logged and
    /// that metric falls back to its zero value. Only when all three
    /// metrics fail does this return an error, so the previously
    /// published status stays in place.
    pub fn fetch(&mut self) -> Result<HostStatus, CollectionError> {
        let mut failures: Vec<String> = Vec::new();

        let gpus = match self.run_command(GPU_COMMAND, &mut failures) {
            Some(stdout) => match parse_gpu_table(&stdout) {
                Ok(gpus) => Some(gpus),
                Err(err) => {
                    warn!(host = %self.name, error = %err, "gpu output parse failed");
                    failures.push(err.to_string());
                    None
                }
            },
            None => None,
        };

        let cpu_usage = match self.run_command(CPU_COMMAND, &mut failures) {
            Some(stdout) => match parse_cpu_line(&stdout) {
                Ok(usage) => Some(usage),
                Err(err) => {
                    warn!(host = %self.name, error = %err, "cpu output parse failed");
                    failures.push(err.to_string());
                    None
                }
            },
            None => None,
        };

        let memory = match self.run_command(MEMORY_COMMAND, &mut failures) {
            Some(stdout) => match parse_memory_block(&stdout) {
                Ok(reading) => Some(reading),
                Err(err) => {
                    warn!(host = %self.name, error = %err, "memory output parse failed");
                    failures.push(err.to_string());
                    None
                }
            },
            None => None,
        };

        if gpus.is_none() && cpu_usage.is_none() && memory.is_none() {
            return Err(CollectionError::AllMetricsFailed {
                host: self.name.clone(),
                reason: failures.join("; "),
            });
        }

        let mut status = HostStatus {
            cpu_usage_percentage: cpu_usage.unwrap_or(0.0),
            gpus: gpus.unwrap_or_default(),
            ..HostStatus::default()
        };
        if let Some(memory) = memory {
            status.memory_used_mb = memory.used_mb;
            status.memory_total_mb = memory.total_mb;
            status.memory_usage_percentage = memory.usage_percentage;
        }
        Ok(status)
    }

    fn run_command(&mut self, command: &str, failures: &mut Vec<String>) -> Option<String> {
        match self.runner.run(command) {
            Ok(output) => Some(output.stdout),
            Err(err) => {
                warn!(host = %self.name, command, error = %err, "command failed");
                failures.push(err.to_string());
                None
            }
        }
    }
}
