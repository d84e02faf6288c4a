use crate::types::AddressRecord;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const HEADERS: [&str; 7] = ["Latitude", "Longitude", "Address", "Postal Code", "City", "State", "Country"];

pub fn write_csv<W: Write>(records: &[AddressRecord], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(HEADERS)?;
    for r in records {
        writer.write_record([
            r.latitude.to_string(),
            r.longitude.to_string(),
            r.address.clone(),
            r.postal_code.clone(),
            r.city.clone(),
            r.state.clone(),
            r.country.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_csv(records: &[AddressRecord], path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
    write_csv(records, file)
        .with_context(|| format!("Failed to write CSV file: {:?}", path))
}
