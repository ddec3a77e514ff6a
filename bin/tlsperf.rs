use clap::Parser;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use multi_stream::ZeroReader;

fn run_client_mode(args: Args) {
    let config = multi_stream::client_config();
    let mut stream = multi_stream::connect(&args.addr, &args.host, config).unwrap();
    println!("Connected successfully to {}", args.addr);

    let mut buf = vec![0u8; args.size];
    let sampling_period = Duration::from_secs(args.period);
    let run_start = Instant::now();
    let mut start = Instant::now();
    let mut window = 0usize;
    let mut total = 0u64;

    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            println!("Connection closed by remote peer");
            break;
        }
        total += n as u64;
        window += n;
        let delta = start.elapsed();
        if delta >= sampling_period {
            let throughput = (window * 8) as f32 / delta.as_secs_f32() / (10u64.pow(6) as f32);
            println!("{throughput} Mbps");
            start = Instant::now();
            window = 0;
        }
    }

    let secs = run_start.elapsed().as_secs_f64();
    let mbps = (total * 8) as f64 / secs / 1e6;
    println!("Read {total} bytes in {secs:.3} seconds ({mbps:.1} Mbps)");
}

fn run_server_mode(args: Args) {
    let config =
        multi_stream::server_config(args.cert.as_deref(), args.key.as_deref()).unwrap();
    let listener = TcpListener::bind(&args.addr).unwrap();
    println!("Listening on {}", args.addr);

    let mut sid = 0;
    loop {
        let (sock, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                println!("Failed to accept connection: {e}");
                continue;
            }
        };
        println!("Accepted connection from: {addr}");

        let cid = sid;
        sid += 1;
        let config = config.clone();
        let total = args.megabytes * 1024 * 1024;
        let size = args.size;
        std::thread::spawn(move || {
            let mut stream = match multi_stream::accept(sock, config) {
                Ok(stream) => stream,
                Err(e) => {
                    println!("[{cid}]: TLS setup failed: {e}");
                    return;
                }
            };
            let mut payload = ZeroReader::new(total);
            let mut buf = vec![0u8; size];
            println!("[{cid}]: sending {total} bytes...");

            let start = Instant::now();
            loop {
                let n = payload.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                if let Err(e) = stream.write_all(&buf[..n]) {
                    println!("[{cid}]: write failed: {e}");
                    return;
                }
            }
            if let Err(e) = stream.flush() {
                println!("[{cid}]: flush failed: {e}");
                return;
            }
            let secs = start.elapsed().as_secs_f64();
            let mbps = (total * 8) as f64 / secs / 1e6;
            println!("[{cid}]: sent {total} bytes in {secs:.3} seconds ({mbps:.1} Mbps)");
        });
    }
}

fn main() {
    let args = Args::parse();
    if args.client {
        run_client_mode(args);
    } else {
        run_server_mode(args);
    }
}

/// The single-connection TLS baseline for the striped perf tool
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen or connect, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The server name presented in the TLS handshake (client mode)
    #[arg(long, default_value = "localhost")]
    host: String,
    /// The read/write buffer size
    #[arg(short, long, default_value = "1048576")]
    size: usize,
    /// The number of megabytes to send per session (server mode)
    #[arg(short, long, default_value = "1024")]
    megabytes: u64,
    /// The sampling period
    #[arg(short, long, default_value = "1")]
    period: u64,
    /// Path to a PEM certificate chain (server mode; self-signed when absent)
    #[arg(long)]
    cert: Option<PathBuf>,
    /// Path to a PEM private key (server mode)
    #[arg(long)]
    key: Option<PathBuf>,
}
