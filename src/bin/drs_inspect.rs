use anyhow::{Context, Result};
use clap::Parser;
use drs4_daq::*;
use log::{warn, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::{fs, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Summarize a DRS4 event file", long_about = None)]
struct Args {
    file: PathBuf,
    /// Print every event header
    #[arg(short, long)]
    events: bool,
}

#[derive(Debug, Default)]
struct ChannelStats {
    min: f32,
    max: f32,
}

#[derive(Debug, Default)]
struct Summary {
    calibration_boards: Vec<u16>,
    events: usize,
    first_serial: Option<u32>,
    last_serial: Option<u32>,
    boards: Vec<u16>,
    /// Indexed by (board position, channel).
    channels: Vec<Vec<ChannelStats>>,
}

impl Summary {
    fn add(&mut self, event: &EventRecord) {
        if self.events == 0 {
            self.first_serial = Some(event.serial);
            self.boards = event.boards.iter().map(|b| b.serial).collect();
            self.channels = event
                .boards
                .iter()
                .map(|b| {
                    b.channels
                        .iter()
                        .map(|_| ChannelStats {
                            min: f32::INFINITY,
                            max: f32::NEG_INFINITY,
                        })
                        .collect()
                })
                .collect();
        }
        self.events += 1;
        self.last_serial = Some(event.serial);

        let range = event.range_center();
        for (stats, board) in self.channels.iter_mut().zip(&event.boards) {
            for (stat, channel) in stats.iter_mut().zip(&board.channels) {
                for mv in channel.millivolts(range) {
                    stat.min = stat.min.min(mv);
                    stat.max = stat.max.max(mv);
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let bytes =
        fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let mut summary = Summary::default();
    let mut decoder = EventDecoder::new(&bytes);
    for record in decoder.by_ref() {
        match record {
            Ok(Record::TimeCalibration(boards)) => {
                summary.calibration_boards = boards.iter().map(|b| b.serial).collect();
            }
            Ok(Record::Event(event)) => {
                if args.events {
                    let t = event.timestamp;
                    println!(
                        "#{:>8}  {:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}  cells {:?}",
                        event.serial,
                        t.year,
                        t.month,
                        t.day,
                        t.hour,
                        t.minute,
                        t.second,
                        t.millisecond,
                        event.boards.iter().map(|b| b.trigger_cell).collect::<Vec<_>>()
                    );
                }
                summary.add(&event);
            }
            Err(e) => {
                warn!("Stopped decoding: {e}");
                break;
            }
        }
    }

    println!("File:              {}", args.file.display());
    println!("Bytes decoded:     {} of {}", decoder.position(), bytes.len());
    println!("Calibrated boards: {:?}", summary.calibration_boards);
    println!("Events:            {}", summary.events);
    if let (Some(first), Some(last)) = (summary.first_serial, summary.last_serial) {
        println!("Serials:           {first} .. {last}");
    }
    for (serial, stats) in summary.boards.iter().zip(&summary.channels) {
        println!("Board #{serial}");
        for (ch, stat) in stats.iter().enumerate() {
            println!(
                "  CH{}  min {:8.2} mV  max {:8.2} mV",
                ch + 1,
                stat.min,
                stat.max
            );
        }
    }
    Ok(())
}
