// Cold-start benchmark for the native backend
// Measures latency from handle creation (lazy, nothing spawned) through the
// first read to end of output, i.e. spawn + pumps + reap + latch.
// Target: p50 < 20ms, p95 < 50ms for trivial executables

use procbox::config::loader::{ControlConfig, LimitDefaults};
use procbox::create_process_with_config;
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 100;
const WARMUP_ITERATIONS: usize = 10;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// Benchmark result
struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");

        match &self.reason {
            None => println!("PASS"),
            Some(reason) => println!("FAIL: {}", reason),
        }
    }
}

fn config() -> ControlConfig {
    ControlConfig {
        limits: LimitDefaults::unlimited(),
        ..ControlConfig::default()
    }
}

/// One run: create, feed `input`, read to EOF, fetch the exit reason.
fn run_once(config: &ControlConfig, executable: &str, input: &[u8]) -> Duration {
    let start = Instant::now();
    let handle = create_process_with_config(config, executable);
    if !input.is_empty() {
        let _ = handle.write_bytes(input.to_vec());
    }
    while handle.read_chunk(8192).is_some() {}
    let _ = handle.get_exit_reason();
    handle.close();
    start.elapsed()
}

fn benchmark(scenario: &str, executable: &str, input: &[u8], p50: Duration, p95: Duration) -> BenchmarkResult {
    let config = config();

    // Warmup
    for _ in 0..WARMUP_ITERATIONS {
        run_once(&config, executable, input);
    }

    // Actual benchmark
    let samples = (0..ITERATIONS)
        .map(|_| run_once(&config, executable, input))
        .collect();

    let stats = LatencyStats::from_samples(samples);

    let passed = stats.p50 < p50 && stats.p95 < p95;
    let reason = if !passed {
        Some(format!(
            "p50={:?} (target <{:?}), p95={:?} (target <{:?})",
            stats.p50, p50, stats.p95, p95
        ))
    } else {
        None
    };

    BenchmarkResult {
        scenario: scenario.to_string(),
        stats,
        passed,
        reason,
    }
}

fn main() {
    println!("procbox Cold-Start Benchmark");
    println!("============================");
    println!("Iterations: {}", ITERATIONS);
    println!("Warmup: {}", WARMUP_ITERATIONS);

    let results = vec![
        benchmark(
            "true (no I/O)",
            "/bin/true",
            b"",
            Duration::from_millis(20),
            Duration::from_millis(50),
        ),
        benchmark(
            "cat (64 KiB echo)",
            "/bin/cat",
            &vec![b'x'; 64 * 1024],
            Duration::from_millis(30),
            Duration::from_millis(80),
        ),
    ];

    for result in &results {
        result.print();
    }

    let all_passed = results.iter().all(|r| r.passed);

    println!("\n============================");
    if all_passed {
        println!("All benchmarks PASSED");
        std::process::exit(0);
    } else {
        println!("Some benchmarks FAILED");
        std::process::exit(1);
    }
}
