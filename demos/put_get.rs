use std::time::{Duration, Instant};

use keyroute::{rpc::Config, ChkBlock, Key, PutOptions, SigningKey, SskBlock, Testnet};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Value to insert, as a CHK block and under an SSK document
    value: String,
    /// Number of nodes in the in-memory network
    #[arg(short, long, default_value_t = 20)]
    nodes: usize,
    /// Document name of the SSK insert
    #[arg(short, long, default_value = "demo")]
    doc: String,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let config = Config {
        accepted_timeout: Duration::from_secs(2),
        search_timeout: Duration::from_secs(10),
        transfer_completion_timeout: Duration::from_secs(10),
        completion_poll_interval: Duration::from_millis(100),
        ..Config::default()
    };
    let testnet = Testnet::with_config(cli.nodes, config).expect("testnet");
    let inserter = &testnet.nodes[0];
    let fetcher = &testnet.nodes[cli.nodes / 2];

    println!("\n=== CHK ===");

    let mut data = cli.value.as_bytes().to_vec();
    data.resize(inserter.config().block.block_size(), 0);
    let block = ChkBlock::new(b"demo".to_vec(), data);
    let key = Key::Chk(*block.key());

    let start = Instant::now();
    let outcome = inserter
        .put_chk(block, PutOptions::default())
        .expect("put_chk failed");
    println!(
        "Inserted {} with {:?} in {:?} seconds",
        key,
        outcome.status,
        start.elapsed().as_secs_f32()
    );

    fetch(fetcher, &key);

    println!("\n=== SSK ===");

    let signer = SigningKey::from_bytes(&rand::random());
    let block = SskBlock::new(&signer, cli.doc.as_bytes(), cli.value.as_bytes());
    let key = Key::Ssk(*block.key());

    let start = Instant::now();
    let outcome = inserter
        .put_ssk(block, PutOptions::default())
        .expect("put_ssk failed");
    println!(
        "Inserted {} with {:?} (collided: {}) in {:?} seconds",
        key,
        outcome.status,
        outcome.has_collided,
        start.elapsed().as_secs_f32()
    );

    fetch(fetcher, &key);
}

fn fetch(node: &keyroute::Node, key: &Key) {
    let start = Instant::now();

    match node.get(key) {
        Ok(block) => println!(
            "Fetched {} bytes in {:?} seconds",
            block.data().len(),
            start.elapsed().as_secs_f32()
        ),
        Err(error) => println!("Fetch failed: {}", error),
    }
}
