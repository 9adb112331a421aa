use std::error::Error;
use std::process::ExitCode;

use libre_bridge::codec::from_hex;
use libre_bridge::libre2::decrypt_fram;
use libre_bridge::temperature::factory_glucose;
use libre_bridge::{DecoderConfig, Sensor};
use log::LevelFilter;
use time::OffsetDateTime;

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        print_usage();
        return Ok(());
    };

    let text = std::fs::read_to_string(&path)?;
    let image = from_hex(&text).ok_or("file does not contain a hex FRAM image")?;

    let mut sensor = Sensor::new();
    if let Some(uid) = args.next() {
        sensor.set_uid(&from_hex(&uid).ok_or("uid is not hex")?);
    }
    if let Some(patch_info) = args.next() {
        sensor.set_patch_info(&from_hex(&patch_info).ok_or("patch info is not hex")?);
    }

    let plain = match (sensor.uid(), sensor.patch_info()) {
        (Some(uid), Some(patch_info)) => decrypt_fram(sensor.sensor_type(), uid, patch_info, &image)?,
        _ => image,
    };
    sensor.set_fram(&plain, OffsetDateTime::now_utc(), &DecoderConfig::default())?;

    println!("Sensor: {} ({})", sensor.serial(), sensor.sensor_type());
    println!("State: {}", sensor.state());
    println!("Age: {} min", sensor.age());
    if let Some(report) = sensor.crc_report() {
        println!("{report}");
    }

    for (label, samples) in [("Trend", sensor.trend()), ("History", sensor.history())] {
        println!("{label}:");
        for sample in samples {
            let sample = match sensor.calibration_info() {
                Some(info) => factory_glucose(sample, info),
                None => sample.clone(),
            };
            let temperature = sample
                .temperature
                .map_or_else(|| String::from("-"), |t| format!("{t:.1}"));
            println!(
                "  #{:<6} raw {:>5}  temp {:>5} °C{}",
                sample.id,
                sample.raw,
                temperature,
                if sample.has_error { "  (error)" } else { "" }
            );
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run --example decode_fram -- <fram.hex> [uid-hex patch-info-hex]");
}
