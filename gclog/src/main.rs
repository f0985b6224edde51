use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;

use clap::{App, Arg};

use arenagc::eventlog::{Event, EventKind, EventReader};

/// One-line description of an event's payload, for the kinds the heap fills in
fn describe(event: &Event) -> String {
    let mut words = event.payload_words();

    match event.kind {
        EventKind::NewArena => match words.next() {
            Some(base) => format!("arena {:#x}", base),
            None => String::new(),
        },
        EventKind::AllocatorSwitch => match words.next() {
            Some(cells) => format!("span of {} cells", cells),
            None => String::new(),
        },
        EventKind::SweepDone => match words.next() {
            Some(cells) => format!("{} free cells", cells),
            None => String::new(),
        },
        EventKind::FreelistDump => {
            let sizes: Vec<u64> = words.collect();
            format!(
                "{} spans, {} cells",
                sizes.len(),
                sizes.iter().sum::<u64>()
            )
        }
        _ if event.payload.is_empty() => String::new(),
        _ => format!("{} bytes", event.payload.len()),
    }
}

fn kind_name(kind: EventKind) -> String {
    match kind {
        EventKind::Unknown(id) => format!("Unknown({})", id),
        kind => format!("{:?}", kind),
    }
}

fn format_event(event: &Event) -> String {
    let detail = describe(event);
    let line = format!(
        "{}.{:09} {}",
        event.time.secs,
        event.time.nanos,
        kind_name(event.kind)
    );

    if detail.is_empty() {
        line
    } else {
        format!("{} {}", line, detail)
    }
}

/// Print every event in the log, or a count per event kind
fn dump(filename: &str, summary: bool) -> Result<(), io::Error> {
    let reader = EventReader::new(BufReader::new(File::open(filename)?));
    let mut counts: BTreeMap<u8, (EventKind, usize)> = BTreeMap::new();

    for event in reader {
        let event = event?;

        if summary {
            counts.entry(event.kind.id()).or_insert((event.kind, 0)).1 += 1;
        } else {
            println!("{}", format_event(&event));
        }
    }

    if summary {
        for (kind, count) in counts.values() {
            println!("{:>16} {}", kind_name(*kind), count);
        }
    }

    Ok(())
}

fn main() {
    let matches = App::new("gclog")
        .about("Dump a heap instrumentation log")
        .arg(
            Arg::with_name("filename")
                .help("Event log to read")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("summary")
                .help("Print event counts per kind instead of every event")
                .short("s")
                .long("summary"),
        )
        .get_matches();

    let filename = matches.value_of("filename").unwrap_or_default();

    dump(filename, matches.is_present("summary")).unwrap_or_else(|err| {
        eprintln!("Terminated: {}", err);
        process::exit(1);
    });
}
