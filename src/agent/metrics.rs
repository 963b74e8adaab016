//! System health snapshot reported by the agent's `get_metrics` handler.
//!
//! Collection is blocking (sysinfo needs two CPU samples a beat apart), so
//! the dispatcher calls these through `spawn_blocking`.

use chrono::Utc;
use serde_json::{json, Value};
use sysinfo::{Disks, System};

fn refreshed() -> System {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    // CPU usage needs a second sample after a short interval.
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    sys
}

fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let percent = ((total - available.min(total)) as f64 / total as f64) * 100.0;

    (percent * 10.0).round() / 10.0
}

/// Full metrics snapshot.
#[must_use]
pub fn collect() -> Value {
    let sys = refreshed();
    let load = System::load_average();
    let disks = Disks::new_with_refreshed_list();

    let disk_entries: Vec<Value> = disks
        .iter()
        .map(|disk| {
            json!({
                "mount_point": disk.mount_point().to_string_lossy(),
                "total_bytes": disk.total_space(),
                "available_bytes": disk.available_space(),
                "used_percent": used_percent(disk.total_space(), disk.available_space()),
            })
        })
        .collect();

    json!({
        "hostname": System::host_name().unwrap_or_else(|| "unknown".to_string()),
        "os": System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        "kernel": System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        "uptime_seconds": System::uptime(),
        "cpu": {
            "count": sys.cpus().len(),
            "usage_percent": f64::from(sys.global_cpu_usage()),
        },
        "memory": {
            "total_bytes": sys.total_memory(),
            "used_bytes": sys.used_memory(),
            "available_bytes": sys.available_memory(),
            "used_percent": used_percent(sys.total_memory(), sys.available_memory()),
        },
        "load_average": {
            "one": load.one,
            "five": load.five,
            "fifteen": load.fifteen,
        },
        "disks": disk_entries,
        "collected_at": Utc::now(),
    })
}

/// Reduced form for dashboards that only want the headline numbers.
#[must_use]
pub fn summary() -> Value {
    let sys = refreshed();
    let disks = Disks::new_with_refreshed_list();

    let worst_disk = disks
        .iter()
        .map(|disk| used_percent(disk.total_space(), disk.available_space()))
        .fold(0.0_f64, f64::max);

    json!({
        "hostname": System::host_name().unwrap_or_else(|| "unknown".to_string()),
        "cpu_percent": f64::from(sys.global_cpu_usage()),
        "memory_percent": used_percent(sys.total_memory(), sys.available_memory()),
        "disk_percent": worst_disk,
        "uptime_seconds": System::uptime(),
    })
}
