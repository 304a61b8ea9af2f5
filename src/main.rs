// Demo runner for the `cosmic_trigger` library.
//
// Feeds a synthetic camera into the pipeline: a dark, face-down sensor with
// read noise and the occasional bright track. Every export is printed as one
// JSON line on stdout; logs go to stderr.
//
// Usage: cosmic_trigger [frames]

use anyhow::{Context, Result};
use cosmic_trigger::collaborators::{ChannelExportSink, StaticDeviceStatus};
use cosmic_trigger::config::DaqConfig;
use cosmic_trigger::core_modules::frame::{AcquisitionTime, ByteSource, FrameMetadata};
use cosmic_trigger::pipeline::DaqPipeline;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_FRAMES: usize = 3000;
const FRAME_INTERVAL: Duration = Duration::from_millis(5);
const TRACK_PROBABILITY: f64 = 0.02;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let frames = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("frame count '{}' is not a number", raw))?,
        None => DEFAULT_FRAMES,
    };

    let config = DaqConfig::from_env();
    let (width, height) = (config.sensor_width, config.sensor_height);
    let (sink, mut records) = ChannelExportSink::new();
    let device = StaticDeviceStatus {
        battery_temperature: Some(30.0),
        location: None,
    };
    let pipeline = DaqPipeline::new(config, Arc::new(sink), Arc::new(device));
    pipeline.start();
    pipeline.begin()?;

    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while let Some(record) = records.recv().await {
            match serde_json::to_string(&record) {
                Ok(json) => {
                    println!("{}", json);
                    printed += 1;
                }
                Err(err) => log::error!("cannot encode export: {}", err),
            }
        }
        printed
    });

    let camera = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            for _ in 0..frames {
                let lease = pipeline
                    .sensor_pool()
                    .acquire()
                    .await
                    .context("sensor pool closed")?;
                let raw = synthetic_exposure(width, height);
                let metadata = FrameMetadata {
                    acquired: AcquisitionTime::now(0),
                    rotation_zz: Some(0.998),
                    facing_back: true,
                    ..FrameMetadata::default()
                };
                let frame = pipeline
                    .prepare_frame(lease)
                    .metadata(metadata)
                    .raw_source(Box::new(ByteSource(raw)))
                    .build();
                if let Err(err) = pipeline.submit_frame(frame) {
                    log::debug!("camera continues after rejected frame: {}", err);
                }
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
            anyhow::Ok(())
        })
    };

    let results = futures::future::join_all(vec![camera]).await;
    for result in results {
        result.context("camera task panicked")??;
    }

    pipeline.wait_idle().await;
    let status = pipeline.status();
    log::info!(
        "finished in {:?}: L1 = {:.2}, L2 = {}, {} recent events",
        status.state,
        status.thresholds.l1,
        status.thresholds.l2,
        status.recent_events.len()
    );
    if let Err(err) = pipeline.pause() {
        log::warn!("could not pause: {}", err);
    }
    pipeline.flush_all();
    pipeline.shutdown().await;
    drop(pipeline);

    let printed = printer.await.context("export printer panicked")?;
    log::info!("{} records exported", printed);
    Ok(())
}

fn synthetic_exposure(width: u32, height: u32) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut raw: Vec<u8> = (0..width * height).map(|_| rng.random_range(0..6)).collect();
    if width > 0 && height > 0 && rng.random::<f64>() < TRACK_PROBABILITY {
        let x0 = rng.random_range(0..width);
        let y = rng.random_range(0..height);
        let length = rng.random_range(1..8u32);
        for x in x0..(x0 + length).min(width) {
            raw[(y * width + x) as usize] = rng.random_range(60..=255);
        }
    }
    raw
}
