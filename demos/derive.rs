use std::env;

use tracing_subscriber::EnvFilter;

use nxkeys::keys::{KeyFiles, print_all_keys};
use nxkeys::{Result, TracingReport};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Directory holding prod.keys / console.keys / title.keys.
    let dir = env::args().nth(1).unwrap_or_else(|| ".".to_owned());
    let (keys, title_keys) = KeyFiles::in_dir(&dir).read(&TracingReport)?;

    print!("{}", print_all_keys(&keys));
    println!("title keys: {}", title_keys.len());

    Ok(())
}
