use std::env;
use std::error;

use reqwest::Url;

/// Container healthcheck probe for the relay itself.
fn main() -> Result<(), Box<dyn error::Error>> {
    let args: Vec<String> = env::args().collect();
    let target = match args.get(1) {
        Some(url) => url.as_str(),
        None => "http://localhost:8500/health",
    };

    let url = Url::parse(target)?;
    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        panic!("Health route answered with status {}", response.status())
    }

    Ok(())
}
