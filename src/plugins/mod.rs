//! Built-in system scanner plugins.

pub mod cpu_memory;
pub mod disk_usage;
pub mod load_avg;
pub mod uptime;

use std::sync::Arc;

use crate::scanner::{Plugin, Registry};

/// Registers the default plugin set on a registry.
pub fn register_builtin(registry: &Registry) -> anyhow::Result<()> {
    let plugins: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(cpu_memory::CpuMemory::new()),
        Arc::new(disk_usage::DiskUsage::new()),
        Arc::new(load_avg::LoadAverage),
        Arc::new(uptime::Uptime::new()),
    ];
    for plugin in plugins {
        registry.register(plugin)?;
    }
    Ok(())
}
