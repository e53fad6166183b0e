//! Echoes the CGI environment, argv and request body.
//!
//! Also declares a `/status` sub-route through the `_routes` export.
//! Build with `cargo build --release --target wasm32-wasip1`.

use std::io::Read;

#[no_mangle]
pub extern "C" fn _routes() {
    println!("/status status");
}

#[no_mangle]
pub extern "C" fn status() {
    println!("Content-Type: application/json");
    println!();
    print!("{{\"status\":\"ok\"}}");
}

fn main() {
    println!("Content-Type: text/plain");
    println!();

    println!("## Environment");
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (key, value) in vars {
        println!("{key}={value}");
    }

    println!("## Arguments");
    for arg in std::env::args() {
        println!("{arg}");
    }

    let mut body = String::new();
    if std::io::stdin().read_to_string(&mut body).is_ok() && !body.is_empty() {
        println!("## Body");
        println!("{body}");
    }
}
