//! CPU and NUMA pinning for the current OS thread.
//!
//! Pinning affects only the invoking thread. Cooperative schedulers must
//! anchor a task to an OS thread before calling into this module. `-1` means
//! "any" for both the CPU and the node argument.

use crate::error::{Error, Result};
use std::sync::OnceLock;

/// Granularity at which affinity is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityScope {
    /// The whole process.
    Process,
    /// A single OS thread.
    Thread,
    /// A scheduler task (requires anchoring to a thread first).
    Task,
}

/// Snapshot of the calling thread's placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityDescriptor {
    /// CPU the thread last ran on, `-1` if unknown.
    pub cpu: i32,
    /// NUMA node of that CPU, `0` on hosts without NUMA.
    pub node: i32,
    /// Scope this implementation binds at.
    pub scope: AffinityScope,
}

/// Host topology: CPU count and the CPUs belonging to each NUMA node.
#[derive(Debug)]
struct Topology {
    cpus: usize,
    /// `nodes[n]` lists the CPU ids of NUMA node `n`. Always non-empty.
    nodes: Vec<Vec<usize>>,
}

static TOPOLOGY: OnceLock<Topology> = OnceLock::new();

fn topology() -> &'static Topology {
    TOPOLOGY.get_or_init(|| {
        let cpus = imp::online_cpus().max(1);
        let mut nodes = imp::numa_nodes(cpus);
        if nodes.is_empty() {
            nodes = vec![(0..cpus).collect()];
        }
        Topology { cpus, nodes }
    })
}

/// Number of online CPUs.
pub fn cpu_count() -> usize {
    topology().cpus
}

/// Number of NUMA nodes; `1` on hosts without NUMA.
pub fn numa_node_count() -> usize {
    topology().nodes.len()
}

/// NUMA node owning the given CPU; node 0 when unknown.
pub fn node_of_cpu(cpu: usize) -> usize {
    topology()
        .nodes
        .iter()
        .position(|cpus| cpus.contains(&cpu))
        .unwrap_or(0)
}

/// NUMA node of the CPU the calling thread currently runs on.
pub fn current_node() -> i32 {
    let cpu = imp::current_cpu();
    if cpu < 0 {
        0
    } else {
        node_of_cpu(cpu as usize) as i32
    }
}

/// `(cpu, node)` the calling thread currently runs on; `(-1, 0)` when the
/// platform cannot tell.
pub fn current() -> (i32, i32) {
    let desc = descriptor();
    (desc.cpu, desc.node)
}

/// Scope this implementation binds at.
pub fn scope() -> AffinityScope {
    AffinityScope::Thread
}

/// Snapshot of the calling thread's placement.
pub fn descriptor() -> AffinityDescriptor {
    let cpu = imp::current_cpu();
    AffinityDescriptor {
        cpu,
        node: if cpu < 0 {
            0
        } else {
            node_of_cpu(cpu as usize) as i32
        },
        scope: scope(),
    }
}

/// Pins the calling thread to a CPU and/or NUMA node.
///
/// `cpu >= 0` binds to that single CPU (the node argument is then only a
/// hint). `cpu < 0, node >= 0` binds to every CPU of the node. Both negative
/// is equivalent to [`unpin_current_thread`].
pub fn pin_current_thread(cpu: i32, node: i32) -> Result<()> {
    let topo = topology();

    if cpu >= 0 {
        let cpu = cpu as usize;
        if cpu >= topo.cpus {
            return Err(Error::InvalidArgument(format!(
                "cpu {cpu} out of range (host has {} cpus)",
                topo.cpus
            )));
        }
        return imp::set_thread_cpus(&[cpu]);
    }

    if node >= 0 {
        let node = node as usize;
        if node >= topo.nodes.len() {
            return Err(Error::InvalidArgument(format!(
                "numa node {node} out of range (host has {} nodes)",
                topo.nodes.len()
            )));
        }
        return imp::set_thread_cpus(&topo.nodes[node]);
    }

    unpin_current_thread()
}

/// Resets the calling thread's mask to all CPUs.
pub fn unpin_current_thread() -> Result<()> {
    let all: Vec<usize> = (0..topology().cpus).collect();
    imp::set_thread_cpus(&all)
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{Error, Result};
    use std::fs;

    pub fn online_cpus() -> usize {
        // SAFETY: plain sysconf query.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n < 1 {
            1
        } else {
            n as usize
        }
    }

    pub fn current_cpu() -> i32 {
        // SAFETY: plain getcpu query; -1 on unsupported kernels.
        unsafe { libc::sched_getcpu() }
    }

    /// Discover NUMA nodes from sysfs. Empty when the host exposes none.
    pub fn numa_nodes(cpus: usize) -> Vec<Vec<usize>> {
        let mut nodes: Vec<(usize, Vec<usize>)> = Vec::new();
        let Ok(entries) = fs::read_dir("/sys/devices/system/node") else {
            return Vec::new();
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) else {
                continue;
            };
            let cpulist = entry.path().join("cpulist");
            let Ok(list) = fs::read_to_string(cpulist) else {
                continue;
            };
            let mut node_cpus = parse_cpulist(list.trim());
            node_cpus.retain(|&c| c < cpus);
            if !node_cpus.is_empty() {
                nodes.push((id, node_cpus));
            }
        }
        nodes.sort_by_key(|(id, _)| *id);
        nodes.into_iter().map(|(_, cpus)| cpus).collect()
    }

    /// Parse sysfs cpulist syntax: `0-3,8,10-11`.
    pub fn parse_cpulist(list: &str) -> Vec<usize> {
        let mut cpus = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            } else if let Ok(cpu) = part.parse::<usize>() {
                cpus.push(cpu);
            }
        }
        cpus
    }

    pub fn set_thread_cpus(cpus: &[usize]) -> Result<()> {
        // SAFETY: cpu_set_t is POD; zeroed is its empty state.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        // SAFETY: pid 0 targets the calling thread; the set outlives the call.
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::last_os_error()))
        }
    }

}

#[cfg(windows)]
mod imp {
    use super::{Error, Result};
    use windows_sys::Win32::System::SystemInformation::{
        GetNumaHighestNodeNumber, GetNumaNodeProcessorMask, GetSystemInfo, SYSTEM_INFO,
    };
    use windows_sys::Win32::System::Threading::{
        GetCurrentProcessorNumber, GetCurrentThread, SetThreadAffinityMask,
    };

    pub fn online_cpus() -> usize {
        // SAFETY: SYSTEM_INFO is POD and fully written by the call.
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        (info.dwNumberOfProcessors as usize).max(1)
    }

    pub fn current_cpu() -> i32 {
        // SAFETY: plain processor-number query.
        unsafe { GetCurrentProcessorNumber() as i32 }
    }

    pub fn numa_nodes(cpus: usize) -> Vec<Vec<usize>> {
        let mut highest: u32 = 0;
        // SAFETY: out-pointer is valid for the call.
        if unsafe { GetNumaHighestNodeNumber(&mut highest) } == 0 {
            return Vec::new();
        }
        let mut nodes = Vec::new();
        for node in 0..=highest {
            let mut mask: u64 = 0;
            // SAFETY: out-pointer is valid for the call.
            if unsafe { GetNumaNodeProcessorMask(node as u8, &mut mask) } == 0 {
                continue;
            }
            let node_cpus: Vec<usize> = (0..cpus.min(64)).filter(|c| mask & (1 << c) != 0).collect();
            if !node_cpus.is_empty() {
                nodes.push(node_cpus);
            }
        }
        nodes
    }

    pub fn set_thread_cpus(cpus: &[usize]) -> Result<()> {
        let mut mask: usize = 0;
        for &cpu in cpus {
            if cpu >= usize::BITS as usize {
                return Err(Error::NotSupported("cpu beyond affinity mask width"));
            }
            mask |= 1 << cpu;
        }
        if mask == 0 {
            return Err(Error::InvalidArgument("empty cpu mask".into()));
        }
        // SAFETY: pseudo-handle targets the calling thread.
        let prev = unsafe { SetThreadAffinityMask(GetCurrentThread(), mask) };
        if prev == 0 {
            Err(Error::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod imp {
    use super::Result;

    pub fn online_cpus() -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    pub fn current_cpu() -> i32 {
        -1
    }

    pub fn numa_nodes(_cpus: usize) -> Vec<Vec<usize>> {
        Vec::new()
    }

    pub fn set_thread_cpus(_cpus: &[usize]) -> Result<()> {
        // No thread-affinity API on this platform; treat as best-effort.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_sane() {
        assert!(cpu_count() >= 1);
        assert!(numa_node_count() >= 1);
        assert!(node_of_cpu(0) < numa_node_count());
    }

    #[test]
    fn test_pin_and_unpin_cpu_zero() {
        // CPU 0 always exists; restore the full mask afterwards.
        pin_current_thread(0, -1).unwrap();
        let desc = descriptor();
        assert_eq!(desc.scope, AffinityScope::Thread);
        unpin_current_thread().unwrap();
    }

    #[test]
    fn test_pin_rejects_out_of_range() {
        assert!(pin_current_thread(i32::MAX, -1).is_err());
        let nodes = numa_node_count() as i32;
        assert!(pin_current_thread(-1, nodes).is_err());
    }

    #[test]
    fn test_pin_any_is_unpin() {
        pin_current_thread(-1, -1).unwrap();
    }
}
