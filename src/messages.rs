//! User-facing wording for event log entries and notifications.
use crate::limiter::LimitError;

pub fn service_started() -> String {
    "Memory watchdog started".to_string()
}

pub fn service_stopped() -> String {
    "Memory watchdog stopped".to_string()
}

pub fn service_stopped_notice() -> String {
    "Memory watchdog has stopped; the process is no longer protected.".to_string()
}

pub fn process_not_found(name: &str) -> String {
    format!("Process {name} not found")
}

pub fn process_exited(name: &str, pid: u32) -> String {
    format!("Process {name} (pid {pid}) exited on its own")
}

pub fn limit_set(name: &str, pid: u32, ceiling_mb: u64) -> String {
    format!("Memory ceiling of {ceiling_mb} MB set for {name} (pid {pid})")
}

pub fn limit_failed(err: &LimitError) -> String {
    let step = match err {
        LimitError::CreationFailed { .. } => "Error creating the memory limit group",
        LimitError::AssociationFailed { .. } => {
            "Error assigning the process to the memory limit group"
        }
        LimitError::LimitConfigFailed { .. } => "Error setting the memory ceiling",
    };
    format!("{step} ({err}). Enforcement stopped.")
}

pub fn limit_exceeded(name: &str, used_mb: u64, ceiling_mb: u64) -> String {
    format!("{name} uses {used_mb} MB, above the {ceiling_mb} MB ceiling. Restarting it.")
}

pub fn starting_process(name: &str) -> String {
    format!("Starting process {name}")
}

pub fn launch_failed(name: &str, detail: &str) -> String {
    format!("Error starting process {name}: {detail}")
}

pub fn launch_failed_notice(name: &str) -> String {
    format!("{name} could not be started.")
}

pub fn unexpected_failure(detail: &str) -> String {
    format!("Unexpected failure, watchdog stopped: {detail}")
}
