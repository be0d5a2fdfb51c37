use durable_system::{cpu, platform};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let f = cpu::features();

    println!("=== Flush instructions ===");
    println!("clflush    : {}", f.clflush);
    println!("clflushopt : {}", f.clflushopt);
    println!("clwb       : {}", f.clwb);

    println!("\n=== Non-temporal store widths ===");
    println!("sse2       : {}", f.sse2);
    println!("avx        : {}", f.avx);
    println!("avx512f    : {}", f.avx512f);

    println!("\n=== Platform ===");
    println!("cache line : {} B", f.cache_line_size);
    println!("page size  : {} B", platform::page_size());
    println!("eADR       : {}", platform::eadr_available());
}
