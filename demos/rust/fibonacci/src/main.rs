//! `GET /fibonacci?23` answers `fib(23)=28657`.
//!
//! Build with `cargo build --release --target wasm32-wasip1`.

fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (0_u64, 1_u64);
    for _ in 0..n {
        (a, b) = (b, a.wrapping_add(b));
    }
    a
}

fn main() {
    // argv[0] is the script name; the query string follows, split on '&'.
    let n = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(0);

    println!("Status: 200");
    println!("Content-Type: text/plain");
    println!();
    print!("fib({n})={}", fib(n));
}
