use std::error::Error;
use std::process::ExitCode;
use std::str::FromStr;

use libre_bridge::transport::ble::{BleConnectOptions, BleTransport};
use libre_bridge::{DecoderConfig, Reader, ReaderError, ResumeState, Transmitter, TransmitterModel};
use log::LevelFilter;

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
    let Some(model) = args.next() else {
        print_usage();
        return Ok(());
    };
    let model = TransmitterModel::from_str(&model)?;

    let options = BleConnectOptions {
        name_contains: args.next(),
        ..Default::default()
    };
    let transport = BleTransport::connect_with_options(model.profile(), options)?;
    if let Some(name) = transport.peripheral_name() {
        println!("Connected: {name}");
    }

    let transmitter = Transmitter::new(model, ResumeState::default(), DecoderConfig::default());
    let mut reader = Reader::new(transport, transmitter);
    reader.start(5)?;

    loop {
        match reader.read_next_frame() {
            Ok(readings) => {
                let transmitter = reader.transmitter();
                if let Some(sensor) = transmitter.sensor() {
                    println!(
                        "Sensor {} ({}), age {} min",
                        sensor.serial(),
                        sensor.sensor_type(),
                        sensor.age()
                    );
                }
                if let Some(battery) = transmitter.device_info().battery {
                    println!("Battery: {battery}%");
                }
                for sample in readings.iter().take(3) {
                    println!("  #{} raw {} -> {:?} mg/dL", sample.id, sample.raw, sample.value);
                }
            }
            Err(ReaderError::NoSensor) => println!("No sensor in range"),
            Err(err) => return Err(err.into()),
        }
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run --features ble --example bridge_probe -- <model> [name-substring]");
    eprintln!("Models: MiaoMiao, Bubble, Libre 2, Limitter, Watlaa, BluCon");
}
