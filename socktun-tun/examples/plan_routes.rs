//! Print the tunnel routes that keep one address off the tunnel
//!
//! # Usage
//!
//! ```bash
//! cargo run -p socktun-tun --example plan_routes -- 203.0.113.5
//! ```

use std::net::Ipv4Addr;

use socktun_tun::{select_strategy, ExclusionTargets, DEFAULT_BYPASS_DNS};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy: Ipv4Addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "203.0.113.5".to_string())
        .parse()?;

    let targets = ExclusionTargets {
        proxy: Some(proxy),
        bypass: DEFAULT_BYPASS_DNS,
    };

    for supports_exclusion in [true, false] {
        let strategy = select_strategy(supports_exclusion);
        let table = strategy.plan(&targets);

        println!("strategy: {}", strategy.name());
        for net in &table.routes {
            println!("  route   {}", net);
        }
        for net in &table.excluded {
            println!("  exclude {}", net);
        }
        println!();
    }

    Ok(())
}
