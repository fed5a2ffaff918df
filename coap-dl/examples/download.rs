//! Download a CoAP resource block by block.
//!
//! Run with `cargo run --example download -- coap://[::1]/fw/image -o image.bin`. An interrupted
//! download resumes with `--offset` and the ETag printed by the failed attempt.

use std::{
    cell::{Cell, RefCell},
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    rc::Rc,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use coap_dl::{
    status, Client, ClientConfig, DownloadConfig, DownloaderConfig, ETag, SinkError,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(name = "download")]
struct Opt {
    /// URL of the resource, `coap://host[:port]/path[?query]`
    url: String,
    /// File to write the resource to, or standard output if absent
    #[clap(short = 'o', long = "output")]
    output: Option<PathBuf>,
    /// Byte offset to resume from; the output file is appended to
    #[clap(long = "offset", default_value = "0")]
    offset: usize,
    /// Hex-encoded ETag of the resource being resumed
    #[clap(long = "etag")]
    etag: Option<String>,
    /// Local port the download must not bind; may be repeated
    #[clap(long = "reserve-port")]
    reserved_ports: Vec<u16>,
    /// Receive buffer size in bytes, which bounds the block size
    #[clap(long = "buffer-size", default_value = "1152")]
    buffer_size: usize,
}

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )
    .unwrap();
    let opt = Opt::parse();
    let code = {
        if let Err(e) = run(opt) {
            eprintln!("ERROR: {e}");
            1
        } else {
            0
        }
    };
    ::std::process::exit(code);
}

#[tokio::main(flavor = "current_thread")]
async fn run(options: Opt) -> Result<()> {
    let mut out: Box<dyn Write> = match &options.output {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(options.offset > 0)
                .truncate(options.offset == 0)
                .open(path)
                .context("failed to open output file")?,
        ),
        None => Box::new(io::stdout()),
    };

    let mut downloader = DownloaderConfig::default();
    downloader.in_buffer_size(options.buffer_size)?;
    let mut config = ClientConfig::default();
    config
        .downloader(downloader)
        .reserved_local_ports(options.reserved_ports.iter().copied());
    let mut client = Client::new(config);

    let last_etag = Rc::new(RefCell::new(None::<ETag>));
    let written = Rc::new(Cell::new(0));
    let outcome = Rc::new(RefCell::new(None));
    let mut download = DownloadConfig::new(options.url.clone());
    download.start_offset(options.offset);
    if let Some(etag) = &options.etag {
        let bytes = hex::decode(etag).context("ETag is not valid hex")?;
        download.etag(ETag::from_slice(&bytes)?);
    }
    {
        let last_etag = last_etag.clone();
        let written = written.clone();
        let outcome = outcome.clone();
        download
            .on_next_block(move |block, etag| {
                *last_etag.borrow_mut() = Some(*etag);
                out.write_all(block)
                    .map_err(|e| SinkError::new(e.to_string()))?;
                written.set(written.get() + block.len());
                Ok(())
            })
            .on_finished(move |result| {
                *outcome.borrow_mut() = Some(result);
            });
    }

    let id = client.download(download)?;
    info!(%id, url = %options.url, "downloading");
    client.run_until_idle().await;

    let result = outcome
        .borrow_mut()
        .take()
        .ok_or_else(|| anyhow!("download never finished"))?;
    if let Err(e) = &result {
        if let Some(etag) = last_etag.borrow().as_ref() {
            error!(
                status = status(&result),
                "resume with --offset {} --etag {}",
                options.offset + written.get(),
                hex::encode(etag)
            );
        }
        return Err(e.clone().into());
    }
    info!("download complete");
    Ok(())
}
