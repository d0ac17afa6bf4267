use crate::backend::{CounterState, EnergyBackend};
use crate::error::{Error, Result};
use crate::sysfs::SysfsRoot;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// RAPL domains the kernel's power PMU may expose. Enumeration order is also
/// column order.
pub const RAPL_DOMAINS: [&str; 4] = ["cores", "gpu", "pkg", "ram"];

const POWER_PMU: &str = "sys/bus/event_source/devices/power";

/// Registry entry for one RAPL domain: the perf event config plus the scale
/// that converts raw counter units to joules.
#[derive(Debug, Clone, PartialEq)]
pub struct RaplEvent {
    pub config: u64,
    pub scale: f64,
    pub unit: String,
}

impl RaplEvent {
    /// Resolve one domain from the power PMU registry. `Ok(None)` means the
    /// domain is absent on this platform and the channel is skipped; a
    /// malformed registry file is an error.
    pub fn resolve(sysfs: &SysfsRoot, domain: &str) -> Result<Option<RaplEvent>> {
        let event_path = format!("{POWER_PMU}/events/energy-{domain}");
        let Some(event) = sysfs.read_optional(&event_path)? else {
            return Ok(None);
        };
        let config = parse_event_config(&event).ok_or_else(|| Error::Parse {
            path: sysfs.path(&event_path),
            detail: format!("unrecognized event descriptor '{}'", event),
        })?;

        // A domain without a scale cannot be converted to joules; treat it
        // like an absent domain.
        let scale_path = format!("{event_path}.scale");
        let Some(scale_text) = sysfs.read_optional(&scale_path)? else {
            return Ok(None);
        };
        let scale: f64 = scale_text.parse().map_err(|e| Error::Parse {
            path: sysfs.path(&scale_path),
            detail: format!("failed to parse '{}': {}", scale_text, e),
        })?;

        let unit = sysfs
            .read_optional(format!("{event_path}.unit"))?
            .unwrap_or_else(|| "Joules".to_string());

        Ok(Some(RaplEvent {
            config,
            scale,
            unit,
        }))
    }
}

/// Parse a PMU event descriptor of the form `event=0x02`.
fn parse_event_config(descriptor: &str) -> Option<u64> {
    let value = descriptor.strip_prefix("event=")?;
    let value = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(value, 16).ok()
}

struct RaplChannel {
    fd: OwnedFd,
    scale: f64,
    state: CounterState,
}

/// On-chip energy counters read through `perf_event_open(2)`. One channel per
/// (cpu, domain) pair that the registry resolves; a channel that fails to
/// resolve is permanently absent from the run.
pub struct RaplBackend {
    channels: Vec<RaplChannel>,
    columns: Vec<String>,
}

impl RaplBackend {
    pub fn open(sysfs: &SysfsRoot, cpus: &[u32]) -> Result<Self> {
        let pmu_type: u32 = match sysfs.read_optional(format!("{POWER_PMU}/type"))? {
            Some(text) => text.parse().map_err(|e| Error::Parse {
                path: sysfs.path(format!("{POWER_PMU}/type")),
                detail: format!("failed to parse '{}': {}", text, e),
            })?,
            None => return Err(Error::RaplUnsupported),
        };

        let mut channels = Vec::new();
        let mut columns = Vec::new();
        for &cpu in cpus {
            for domain in RAPL_DOMAINS {
                let Some(event) = RaplEvent::resolve(sysfs, domain)? else {
                    continue;
                };
                let fd = perf_event_open(pmu_type, event.config, cpu).map_err(|e| {
                    if e.raw_os_error() == Some(libc::EACCES) {
                        Error::PermissionDenied
                    } else {
                        Error::CounterOpen {
                            cpu,
                            domain,
                            source: e,
                        }
                    }
                })?;
                channels.push(RaplChannel {
                    fd,
                    scale: event.scale,
                    state: CounterState::default(),
                });
                columns.push(format!("core_{}_{}", cpu, domain));
            }
        }

        Ok(Self { channels, columns })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl EnergyBackend for RaplBackend {
    fn name(&self) -> &'static str {
        "rapl"
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn reset(&mut self) -> Result<()> {
        for ch in &mut self.channels {
            let raw = read_counter(&ch.fd)?;
            ch.state.reset(raw);
        }
        Ok(())
    }

    fn sample(&mut self, elapsed: f64, row: &mut Vec<f64>) -> Result<()> {
        for ch in &mut self.channels {
            let raw = read_counter(&ch.fd)?;
            row.push(ch.state.power(raw, ch.scale, elapsed));
        }
        Ok(())
    }

    fn totals(&mut self, out: &mut Vec<f64>) -> Result<()> {
        for ch in &self.channels {
            let raw = read_counter(&ch.fd)?;
            out.push(ch.state.energy(raw, ch.scale));
        }
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the OwnedFds closes the perf counters.
        self.channels.clear();
    }
}

/// Pick the cpu to attach counters to for every physical package. RAPL events
/// count per package, so one cpu per package covers the machine.
pub fn default_query_cpus(sysfs: &SysfsRoot) -> Vec<u32> {
    let entries = match sysfs.list_dir("sys/devices/system/cpu") {
        Ok(e) => e,
        Err(_) => return vec![0],
    };

    let mut first_cpu_of_package: BTreeMap<u32, u32> = BTreeMap::new();
    for entry in entries {
        let Some(cpu) = entry
            .strip_prefix("cpu")
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let package = sysfs
            .read_optional(format!(
                "sys/devices/system/cpu/{}/topology/physical_package_id",
                entry
            ))
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u32>().ok());
        let Some(package) = package else { continue };
        first_cpu_of_package
            .entry(package)
            .and_modify(|c| *c = (*c).min(cpu))
            .or_insert(cpu);
    }

    if first_cpu_of_package.is_empty() {
        vec![0]
    } else {
        first_cpu_of_package.into_values().collect()
    }
}

/// Kernel ABI for `perf_event_open(2)`. `libc` does not expose this struct (or
/// the `PERF_FLAG_FD_CLOEXEC` flag) on the gnu targets, so mirror the kernel's
/// `struct perf_event_attr` layout here. Unions are represented as their widest
/// member; only `type_`, `size`, and `config` are ever written.
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy)]
struct perf_event_attr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1_or_bp_addr: u64,
    config2_or_bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
}

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

fn perf_event_open(pmu_type: u32, config: u64, cpu: u32) -> io::Result<OwnedFd> {
    let mut attr: perf_event_attr = unsafe { std::mem::zeroed() };
    attr.type_ = pmu_type;
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.config = config;

    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const perf_event_attr,
            -1 as libc::pid_t,
            cpu as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn read_counter(fd: &OwnedFd) -> Result<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::CounterRead(io::Error::last_os_error()));
    }
    if n as usize != buf.len() {
        return Err(Error::CounterRead(io::Error::other(
            "short read from energy counter",
        )));
    }
    Ok(u64::from_ne_bytes(buf))
}
