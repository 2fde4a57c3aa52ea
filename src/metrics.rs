//! System metric samples: collection, ring-buffer storage, aggregation.
//!
//! The collector reads Linux procfs and `statvfs`; rates (CPU percentage,
//! network throughput) are deltas against the previous collection, so the
//! first sample reports zero rates. Other platforms produce empty samples.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuMetrics {
    pub percent: f64,
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

/// Disk I/O activity: cumulative counters since boot plus delta rates
/// against the previous collection.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskIoMetrics {
    pub reads: u64,
    pub writes: u64,
    pub data_read: u64,
    pub data_written: u64,
    pub read_rate: f64,
    pub write_rate: f64,
    pub data_read_rate: f64,
    pub data_write_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkMetrics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

/// One snapshot of system state, timestamped in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemMetrics {
    pub timestamp: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub disk_io: DiskIoMetrics,
    pub network: NetworkMetrics,
}

impl SystemMetrics {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CpuTimes {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait
    }
}

#[derive(Debug, Clone, Copy)]
struct NetCounters {
    rx_bytes: u64,
    tx_bytes: u64,
    rx_packets: u64,
    tx_packets: u64,
    at_millis: u64,
}

#[derive(Debug, Clone, Copy)]
struct DiskIoCounters {
    reads: u64,
    writes: u64,
    data_read: u64,
    data_written: u64,
    at_millis: u64,
}

/// Snapshot producer. Keeps previous CPU, disk I/O, and network counters so
/// percentages and rates can be derived.
#[derive(Default)]
pub struct MetricsCollector {
    prev_cpu: Option<CpuTimes>,
    prev_net: Option<NetCounters>,
    prev_disk_io: Option<DiskIoCounters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self) -> SystemMetrics {
        let timestamp = now_millis();

        let cpu = self.collect_cpu();
        let memory = collect_memory();
        let disk = collect_disk();
        let disk_io = self.collect_disk_io(timestamp);
        let network = self.collect_network(timestamp);

        SystemMetrics {
            timestamp,
            cpu,
            memory,
            disk,
            disk_io,
            network,
        }
    }

    fn collect_cpu(&mut self) -> CpuMetrics {
        let Some(now) = read_cpu_times() else {
            return CpuMetrics::default();
        };

        let metrics = match self.prev_cpu {
            Some(prev) if now.total() > prev.total() => {
                let total = (now.total() - prev.total()) as f64;
                let idle = (now.idle - prev.idle) as f64;
                let user = (now.user + now.nice - prev.user - prev.nice) as f64;
                let system = (now.system - prev.system) as f64;
                CpuMetrics {
                    percent: (total - idle) / total * 100.0,
                    user: user / total * 100.0,
                    system: system / total * 100.0,
                    idle: idle / total * 100.0,
                }
            }
            _ => CpuMetrics::default(),
        };

        self.prev_cpu = Some(now);
        metrics
    }

    fn collect_disk_io(&mut self, timestamp: u64) -> DiskIoMetrics {
        let Some((reads, writes, data_read, data_written)) = read_disk_io_counters() else {
            return DiskIoMetrics::default();
        };

        let (read_rate, write_rate, data_read_rate, data_write_rate) = match self.prev_disk_io {
            Some(prev) if timestamp > prev.at_millis => {
                let secs = (timestamp - prev.at_millis) as f64 / 1000.0;
                (
                    reads.saturating_sub(prev.reads) as f64 / secs,
                    writes.saturating_sub(prev.writes) as f64 / secs,
                    data_read.saturating_sub(prev.data_read) as f64 / secs,
                    data_written.saturating_sub(prev.data_written) as f64 / secs,
                )
            }
            _ => (0.0, 0.0, 0.0, 0.0),
        };

        self.prev_disk_io = Some(DiskIoCounters {
            reads,
            writes,
            data_read,
            data_written,
            at_millis: timestamp,
        });

        DiskIoMetrics {
            reads,
            writes,
            data_read,
            data_written,
            read_rate,
            write_rate,
            data_read_rate,
            data_write_rate,
        }
    }

    fn collect_network(&mut self, timestamp: u64) -> NetworkMetrics {
        let Some((rx_bytes, tx_bytes, rx_packets, tx_packets)) = read_network_counters() else {
            return NetworkMetrics::default();
        };

        let (rx_rate, tx_rate) = match self.prev_net {
            Some(prev) if timestamp > prev.at_millis => {
                let secs = (timestamp - prev.at_millis) as f64 / 1000.0;
                (
                    rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs,
                    tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs,
                )
            }
            _ => (0.0, 0.0),
        };

        self.prev_net = Some(NetCounters {
            rx_bytes,
            tx_bytes,
            rx_packets,
            tx_packets,
            at_millis: timestamp,
        });

        NetworkMetrics {
            rx_bytes,
            tx_bytes,
            rx_packets,
            tx_packets,
            rx_rate,
            tx_rate,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }

    let mut next = || fields.next().and_then(|f| f.parse::<u64>().ok());
    Some(CpuTimes {
        user: next()?,
        nice: next()?,
        system: next()?,
        idle: next()?,
        iowait: next().unwrap_or(0),
    })
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
fn collect_memory() -> MemoryMetrics {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return MemoryMetrics::default();
    };

    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
        }
    }

    let total = total_kb * 1024;
    let free = available_kb * 1024;
    let used = total.saturating_sub(free);
    MemoryMetrics {
        total,
        used,
        free,
        percent: percent_of(used, total),
    }
}

#[cfg(not(target_os = "linux"))]
fn collect_memory() -> MemoryMetrics {
    MemoryMetrics::default()
}

fn collect_disk() -> DiskMetrics {
    unsafe {
        let mut vfs: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(b"/\0".as_ptr() as *const libc::c_char, &mut vfs) != 0 {
            return DiskMetrics::default();
        }

        let frsize = vfs.f_frsize as u64;
        let total = vfs.f_blocks as u64 * frsize;
        let free = vfs.f_bavail as u64 * frsize;
        let used = total.saturating_sub(vfs.f_bfree as u64 * frsize);
        DiskMetrics {
            total,
            used,
            free,
            percent: percent_of(used, total),
        }
    }
}

/// /proc/diskstats sectors are always 512 bytes.
#[cfg(target_os = "linux")]
const DISKSTATS_SECTOR_SIZE: u64 = 512;

#[cfg(target_os = "linux")]
fn read_disk_io_counters() -> Option<(u64, u64, u64, u64)> {
    let diskstats = std::fs::read_to_string("/proc/diskstats").ok()?;
    let mut reads = 0u64;
    let mut writes = 0u64;
    let mut data_read = 0u64;
    let mut data_written = 0u64;

    for line in diskstats.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name reads _ sectors_read _ writes _ sectors_written ...
        if fields.len() < 10 || !is_physical_disk(fields[2]) {
            continue;
        }
        reads += fields[3].parse::<u64>().unwrap_or(0);
        data_read += fields[5].parse::<u64>().unwrap_or(0) * DISKSTATS_SECTOR_SIZE;
        writes += fields[7].parse::<u64>().unwrap_or(0);
        data_written += fields[9].parse::<u64>().unwrap_or(0) * DISKSTATS_SECTOR_SIZE;
    }

    Some((reads, writes, data_read, data_written))
}

/// Whole physical disks only; virtual devices and partitions would double
/// count the same traffic.
#[cfg(target_os = "linux")]
fn is_physical_disk(name: &str) -> bool {
    for prefix in ["loop", "ram", "zram", "dm-", "md", "sr"] {
        if name.starts_with(prefix) {
            return false;
        }
    }
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        // Partitions carry a p suffix group (nvme0n1p1, mmcblk0p2).
        return !name.contains('p');
    }
    // sda1, vdb2 and friends are partitions of a letter-named disk.
    !name.ends_with(|c: char| c.is_ascii_digit())
}

#[cfg(not(target_os = "linux"))]
fn read_disk_io_counters() -> Option<(u64, u64, u64, u64)> {
    None
}

#[cfg(target_os = "linux")]
fn read_network_counters() -> Option<(u64, u64, u64, u64)> {
    let dev = std::fs::read_to_string("/proc/net/dev").ok()?;
    let mut rx_bytes = 0u64;
    let mut tx_bytes = 0u64;
    let mut rx_packets = 0u64;
    let mut tx_packets = 0u64;

    // Skip the two header lines; aggregate every interface except loopback.
    for line in dev.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() >= 10 {
            rx_bytes += fields[0];
            rx_packets += fields[1];
            tx_bytes += fields[8];
            tx_packets += fields[9];
        }
    }

    Some((rx_bytes, tx_bytes, rx_packets, tx_packets))
}

#[cfg(not(target_os = "linux"))]
fn read_network_counters() -> Option<(u64, u64, u64, u64)> {
    None
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Aggregate over a sample window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregatedStats {
    pub avg_cpu: f64,
    pub max_cpu: f64,
    pub min_cpu: f64,
    pub avg_memory: f64,
    pub max_memory: f64,
    pub min_memory: f64,
    pub total_network_rx: u64,
    pub total_network_tx: u64,
}

/// Mutex-guarded ring buffer of samples, oldest evicted first.
pub struct MetricsStorage {
    samples: Mutex<VecDeque<SystemMetrics>>,
    max_samples: usize,
}

impl MetricsStorage {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples.min(4096))),
            max_samples: max_samples.max(1),
        }
    }

    pub fn add_sample(&self, sample: SystemMetrics) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back(sample);
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<SystemMetrics> {
        self.samples.lock().unwrap().back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples with `start_ms <= timestamp <= end_ms`, oldest first.
    pub fn samples_between(&self, start_ms: u64, end_ms: u64) -> Vec<SystemMetrics> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.timestamp >= start_ms && s.timestamp <= end_ms)
            .copied()
            .collect()
    }

    /// Samples from the trailing `seconds` window.
    pub fn last_seconds(&self, seconds: u64) -> Vec<SystemMetrics> {
        let now = now_millis();
        self.samples_between(now.saturating_sub(seconds * 1000), now)
    }

    pub fn aggregate(&self, start_ms: u64, end_ms: u64) -> AggregatedStats {
        let samples = self.samples_between(start_ms, end_ms);
        let mut stats = AggregatedStats::default();
        if samples.is_empty() {
            return stats;
        }

        stats.min_cpu = 100.0;
        stats.min_memory = 100.0;

        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;
        for sample in &samples {
            cpu_sum += sample.cpu.percent;
            memory_sum += sample.memory.percent;
            stats.max_cpu = stats.max_cpu.max(sample.cpu.percent);
            stats.min_cpu = stats.min_cpu.min(sample.cpu.percent);
            stats.max_memory = stats.max_memory.max(sample.memory.percent);
            stats.min_memory = stats.min_memory.min(sample.memory.percent);
        }

        let first = samples.first().map(|s| s.network).unwrap_or_default();
        let last = samples.last().map(|s| s.network).unwrap_or_default();

        stats.avg_cpu = cpu_sum / samples.len() as f64;
        stats.avg_memory = memory_sum / samples.len() as f64;
        stats.total_network_rx = last.rx_bytes.saturating_sub(first.rx_bytes);
        stats.total_network_tx = last.tx_bytes.saturating_sub(first.tx_bytes);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp: u64, cpu: f64, memory: f64, rx: u64) -> SystemMetrics {
        SystemMetrics {
            timestamp,
            cpu: CpuMetrics {
                percent: cpu,
                ..CpuMetrics::default()
            },
            memory: MemoryMetrics {
                percent: memory,
                ..MemoryMetrics::default()
            },
            network: NetworkMetrics {
                rx_bytes: rx,
                ..NetworkMetrics::default()
            },
            ..SystemMetrics::default()
        }
    }

    #[test]
    fn ring_evicts_oldest() {
        let storage = MetricsStorage::new(3);
        for i in 0..5 {
            storage.add_sample(sample(i, i as f64, 0.0, 0));
        }

        assert_eq!(storage.len(), 3);
        assert_eq!(storage.latest().unwrap().timestamp, 4);
        // Oldest two were dropped.
        assert!(storage.samples_between(0, 1).is_empty());
    }

    #[test]
    fn samples_between_is_inclusive() {
        let storage = MetricsStorage::new(10);
        for i in [100u64, 200, 300, 400] {
            storage.add_sample(sample(i, 0.0, 0.0, 0));
        }

        let window = storage.samples_between(200, 300);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].timestamp, 200);
        assert_eq!(window[1].timestamp, 300);
    }

    #[test]
    fn aggregate_computes_extremes_and_deltas() {
        let storage = MetricsStorage::new(10);
        storage.add_sample(sample(1, 10.0, 40.0, 1_000));
        storage.add_sample(sample(2, 30.0, 60.0, 4_000));
        storage.add_sample(sample(3, 20.0, 50.0, 6_000));

        let stats = storage.aggregate(0, 10);
        assert!((stats.avg_cpu - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.max_cpu, 30.0);
        assert_eq!(stats.min_cpu, 10.0);
        assert_eq!(stats.max_memory, 60.0);
        assert_eq!(stats.min_memory, 40.0);
        assert_eq!(stats.total_network_rx, 5_000);
    }

    #[test]
    fn aggregate_of_empty_window_is_zeroed() {
        let storage = MetricsStorage::new(10);
        let stats = storage.aggregate(0, 10);
        assert_eq!(stats.avg_cpu, 0.0);
        assert_eq!(stats.min_cpu, 0.0);
        assert_eq!(stats.total_network_rx, 0);
    }

    #[test]
    fn sample_serializes_with_nested_sections() {
        let json = sample(123, 1.0, 2.0, 3).to_json();
        assert!(json.contains("\"timestamp\":123"));
        assert!(json.contains("\"cpu\":{"));
        assert!(json.contains("\"memory\":{"));
        assert!(json.contains("\"disk\":{"));
        assert!(json.contains("\"disk_io\":{"));
        assert!(json.contains("\"network\":{"));
    }

    #[test]
    fn disk_io_serializes_counts_and_rates() {
        let metrics = SystemMetrics {
            disk_io: DiskIoMetrics {
                reads: 10,
                writes: 20,
                data_read: 5120,
                data_written: 1024,
                read_rate: 2.0,
                write_rate: 4.0,
                data_read_rate: 1024.0,
                data_write_rate: 512.0,
            },
            ..SystemMetrics::default()
        };
        let json = metrics.to_json();
        assert!(json.contains("\"reads\":10"));
        assert!(json.contains("\"data_written\":1024"));
        assert!(json.contains("\"read_rate\":2.0"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn physical_disk_filter() {
        assert!(is_physical_disk("sda"));
        assert!(is_physical_disk("vdb"));
        assert!(is_physical_disk("nvme0n1"));
        assert!(is_physical_disk("mmcblk0"));

        assert!(!is_physical_disk("sda1"));
        assert!(!is_physical_disk("nvme0n1p2"));
        assert!(!is_physical_disk("mmcblk0p1"));
        assert!(!is_physical_disk("loop3"));
        assert!(!is_physical_disk("ram0"));
        assert!(!is_physical_disk("dm-0"));
        assert!(!is_physical_disk("md127"));
    }

    #[test]
    fn collector_produces_bounded_percentages() {
        let mut collector = MetricsCollector::new();
        let first = collector.collect();
        assert_eq!(first.cpu.percent, 0.0);
        assert_eq!(first.disk_io.read_rate, 0.0);
        assert_eq!(first.disk_io.write_rate, 0.0);

        std::thread::sleep(std::time::Duration::from_millis(50));
        let second = collector.collect();
        assert!(second.cpu.percent >= 0.0 && second.cpu.percent <= 100.0);
        assert!(second.memory.percent >= 0.0 && second.memory.percent <= 100.0);
        assert!(second.timestamp >= first.timestamp);
    }
}
