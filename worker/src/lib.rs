pub mod blat;
pub mod dispatcher;

pub use blat::BlatCommand;
pub use dispatcher::{CancelReason, Cancellation, DispatchReport, Dispatcher};

use sysinfo::{CpuExt, System, SystemExt};

/// Foto de la carga del host al momento de lanzar los workers.
#[derive(Debug, Clone, Copy)]
pub struct HostLoad {
    pub cpus: usize,
    pub cpu_percent: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
}

pub fn host_load() -> HostLoad {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    HostLoad {
        cpus: sys.cpus().len().max(1),
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        // sysinfo 0.29 reporta bytes
        mem_used_mb: sys.used_memory() / 1024 / 1024,
        mem_total_mb: sys.total_memory() / 1024 / 1024,
    }
}
