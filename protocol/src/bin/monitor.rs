use clap::Parser;
use odorlink::{
    Actuator, Controller, DeviceId, MeasurementMode, PortDescriptor, Request, Response, Session,
    SessionConfig,
    session::Event,
    transport::simulator::SimulatorConfig,
};
use std::error::Error;
use tokio::{
    sync::broadcast::error::RecvError,
    time::{self, Duration, Instant},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, conflicts_with = "simulate")]
    port: Option<String>,

    /// Use a simulated odor display instead of a serial port
    #[arg(short, long)]
    simulate: bool,

    /// Print measurements for this many seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Odor channel to open (1-9)
    #[arg(short, long, requires = "flow", value_parser = clap::value_parser!(u8).range(1..=9))]
    odor: Option<u8>,

    /// Odorant flow for the selected channel in sccm
    #[arg(short, long, requires = "odor")]
    flow: Option<f32>,

    /// List available serial ports and exit
    #[arg(short, long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();

    if args.list {
        for path in odorlink::serial::list_ports()? {
            println!("{path}");
        }

        return Ok(());
    }

    let desc = match args.port {
        Some(path) => PortDescriptor::Serial(path),
        None if args.simulate => PortDescriptor::Simulated(SimulatorConfig::default()),
        None => return Err("either --port or --simulate is required".into()),
    };
    let (session, mut events) = Session::open(&desc, SessionConfig::default()).await?;

    if let Some(Response::Version(v)) = session.request(&Request::QueryVersion).await?.response {
        println!(
            "Hardware {}.{}, software {}.{}, protocol {}.{}",
            v.hardware.0, v.hardware.1, v.software.0, v.software.1, v.protocol.0, v.protocol.1
        );
    }

    if let Some(Response::Devices(devices)) =
        session.request(&Request::QueryDevices).await?.response
    {
        for id in devices.ids() {
            if let Some(Response::Capabilities(caps)) = session
                .request(&Request::QueryCapabilities(id))
                .await?
                .response
            {
                println!("{id}: {}", caps.capabilities);
            }
        }
    }

    if let (Some(channel), Some(flow)) = (args.odor, args.flow) {
        let id = DeviceId::odor(channel).ok_or("invalid odor channel")?;

        session
            .request(&Request::SetActuators(vec![
                Actuator::new(id)
                    .with(Controller::OdorantFlow, flow)
                    .with(Controller::OdorantValve, -1.0),
            ]))
            .await?;
        println!("Opened {id} at {flow} sccm");
    }

    session
        .request(&Request::SetMeasurements(MeasurementMode::Start))
        .await?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);

    while let Ok(evt) = time::timeout_at(deadline, events.recv()).await {
        match evt {
            Ok(Event::Data(data)) => {
                println!("{:>10} ms", data.timestamp);

                for m in &data.measurements {
                    println!("  {}: {:?}", m.device, m.values);
                }
            }
            Err(RecvError::Lagged(count)) => eprintln!("Skipped {count} events"),
            Ok(Event::Closed) | Err(RecvError::Closed) => break,
            Ok(_) => {}
        }
    }

    if session.is_open() {
        session
            .request(&Request::SetMeasurements(MeasurementMode::Stop))
            .await?;
    }

    session.close().await;

    Ok(())
}
