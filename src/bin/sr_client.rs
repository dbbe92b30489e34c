//! Streams a WAV file to a recognition server and prints what comes back.
//!
//! ```text
//! sr_client --port 62290 --codec ulaw --locale en-US speech.wav
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use remote_speech_backend::audio::format::pcm_to_float;
use remote_speech_backend::audio::{AudioSampleFormat, CodecRegistry};
use remote_speech_backend::config::AppConfig;
use remote_speech_backend::protocol::RemoteSpeechRecognizer;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sr_client", version, about = "Remote speech recognition demo client")]
struct Args {
    /// Server host (defaults to client.remote_host)
    #[arg(long)]
    host: Option<String>,

    /// Server port (defaults to client.remote_port)
    #[arg(long)]
    port: Option<u16>,

    /// Upload codec: pcm, ulaw or wav (defaults to client.codec)
    #[arg(long)]
    codec: Option<String>,

    #[arg(long, default_value = "en-US")]
    locale: String,

    /// Audio per SEND_AUDIO message, in milliseconds
    #[arg(long, default_value_t = 100)]
    chunk_ms: u32,

    /// Pace the upload at real time instead of sending as fast as possible
    #[arg(long)]
    realtime: bool,

    /// WAV file to recognize
    file: PathBuf,
}

/// Read a WAV file into interleaved float samples.
fn read_wav(path: &PathBuf) -> Result<(AudioSampleFormat, Vec<f32>)> {
    let mut file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let (header, data) = wav::read(&mut file)
        .with_context(|| format!("{} is not a readable WAV file", path.display()))?;

    let samples = match data {
        wav::BitDepth::Eight(bytes) => bytes
            .into_iter()
            .map(|b| (b as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(pcm) => pcm_to_float(&pcm),
        wav::BitDepth::TwentyFour(pcm) => pcm
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => bail!("{} contains no audio", path.display()),
    };

    let format = AudioSampleFormat::new(header.sampling_rate, header.channel_count);
    format.validate()?;
    Ok((format, samples))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remote_speech_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let args = Args::parse();
    let config = AppConfig::load()?;
    let mut client_config = config.client;
    if let Some(host) = args.host {
        client_config.remote_host = host;
    }
    if let Some(port) = args.port {
        client_config.remote_port = port;
    }
    if let Some(codec) = args.codec {
        client_config.codec = codec;
    }

    let (format, samples) = read_wav(&args.file)?;
    let chunk_len = (format.samples_per_second() * args.chunk_ms.max(1) as usize / 1000).max(1);
    eprintln!(
        "{}: {}, {:.2}s, {} chunks",
        args.file.display(),
        format,
        samples.len() as f64 / format.samples_per_second() as f64,
        samples.len().div_ceil(chunk_len)
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut recognizer = RemoteSpeechRecognizer::new(client_config, Arc::new(CodecRegistry::new()));
    let printer = recognizer.partial_results().map(|mut partials| {
        tokio::spawn(async move {
            while let Some(text) = partials.next().await {
                println!("partial: {}", text);
            }
        })
    });

    if !recognizer.start(&args.locale, format, &cancel).await {
        bail!("could not start a recognition session");
    }

    let pace = std::time::Duration::from_millis(args.chunk_ms as u64);
    for chunk in samples.chunks(chunk_len) {
        recognizer.write(chunk, &cancel).await?;
        if args.realtime {
            tokio::time::sleep(pace).await;
        }
    }

    let result = recognizer.finish(&cancel).await;
    recognizer.dispose();
    drop(recognizer);

    // The partial stream ends once the recognizer is gone
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
