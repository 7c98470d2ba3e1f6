use sysinfo::System;

/// Number of logical CPUs on this machine.
pub fn cpu_count() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.cpus().len()
}

/// Warn when more local workers are requested than there are cores to run them.
///
/// This won't stop the run, the workers will just compete for CPU and may skew the results.
/// Returns whether the warning was logged.
pub fn warn_if_oversubscribed(requested_workers: usize) -> bool {
    check_oversubscribed(requested_workers, cpu_count())
}

fn check_oversubscribed(requested_workers: usize, cpus: usize) -> bool {
    if cpus > 0 && requested_workers > cpus {
        log::warn!(
            "Starting {requested_workers} workers on a machine with {cpus} cores, \
             workers will compete for CPU"
        );
        return true;
    }
    false
}
