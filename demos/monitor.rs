use enphase_envoy::{EnvoyClient, Phase, Reading};
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> enphase_envoy::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let host = args.get(1).expect("usage: monitor <host> [--http] [--token <token>]");
    let use_http = args.iter().any(|a| a == "--http");
    let token = args
        .iter()
        .position(|a| a == "--token")
        .and_then(|i| args.get(i + 1));

    let mut builder = EnvoyClient::builder(host);
    if use_http {
        builder = builder.protocol("http");
    }
    if let Some(token) = token {
        builder = builder.bearer_token(token);
    }
    let mut client = builder.build();

    loop {
        client.refresh().await?;

        if let Some(serial) = client.serial_number() {
            println!(
                "Envoy {serial} (fw {})",
                client.firmware_version().unwrap_or("?")
            );
        }
        print_metric("production", client.production(None));
        print_metric("today", client.daily_production(None));
        print_metric("lifetime", client.lifetime_production(None));
        print_metric("consumption", client.consumption(None));
        print_metric("net", client.net_consumption(None));
        for phase in Phase::ALL {
            if let Reading::Value(w) = client.production(Some(phase)) {
                println!("  production {phase}: {w:.0} W");
            }
        }
        for battery in client.battery_storage() {
            println!(
                "  battery {}: {:?}% full",
                battery.serial_number, battery.percent_full
            );
        }
        if let Reading::Value(inverters) = client.inverters_production() {
            for (serial, inv) in &inverters {
                println!(
                    "  inverter {serial}: {:.0} W at {}",
                    inv.watts,
                    inv.last_report_time()
                );
            }
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}

fn print_metric(name: &str, reading: Reading<f64>) {
    match reading {
        Reading::Value(v) => println!("  {name}: {v:.0}"),
        Reading::NoData => println!("  {name}: no data"),
        Reading::Unsupported(reason) => println!("  {name}: {reason}"),
    }
}
