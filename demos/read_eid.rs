use std::env;

use eid_bac::{bytes2hex, compose_mrz_info, mrz_info_from_td1, BacError, EidComms};
use tracing::{error, info};

fn main() -> Result<(), BacError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let reader = match readers.next() {
        Some(reader) => reader,
        None => {
            error!("No readers are connected.");
            std::process::exit(1);
        }
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let mut comms = EidComms::<pcsc::Card>::new(card);

    // Select the eID application.
    comms.select_application()?;

    // Either the raw TD1 MRZ lines or the individual fields work as input.
    let mrz_info = match (env::var("MRZ_LINE1"), env::var("MRZ_LINE2")) {
        (Ok(line1), Ok(line2)) => {
            let line3 = env::var("MRZ_LINE3").unwrap_or_default();
            mrz_info_from_td1(&line1, &line2, &line3)?
        }
        _ => {
            let doc_no = env::var("DOCNO").expect("Please set MRZ_LINE1/MRZ_LINE2 or DOCNO");
            let birthdate =
                env::var("BIRTHDATE").expect("Please set BIRTHDATE environment variable");
            let expirydate =
                env::var("EXPIRYDATE").expect("Please set EXPIRYDATE environment variable");
            compose_mrz_info(&doc_no, &birthdate, &expirydate)?
        }
    };

    comms.establish_bac_session_keys(mrz_info.as_bytes())?;

    // Read EF.COM
    let ef_com = comms.read_file(b"\x01\x1E", "EF.COM")?;
    info!("Data from the EF.COM: {}", bytes2hex(&ef_com));

    // Read EF.SOD
    let ef_sod = comms.read_file(b"\x01\x1D", "EF.SOD")?;
    info!("Data from the EF.SOD: {}", bytes2hex(&ef_sod));

    // Read EF.DG1
    let ef_dg1 = comms.read_file(b"\x01\x01", "EF.DG1")?;
    info!("Data from the EF.DG1: {}", bytes2hex(&ef_dg1));

    return Ok(());
}
