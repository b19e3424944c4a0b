//! Persisted dialogue state: the global store and flags.
//!
//! Everything else (the operand stack, locals, choice accumulators) is
//! per-scene and intentionally not saved; hosts re-run the scene after a
//! load.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::variant::Variant;

use super::Interpreter;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SaveData {
    pub globals: HashMap<String, Variant>,
    pub flags: HashMap<String, Variant>,
}

impl SaveData {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut rdr = File::open(&path)
            .with_context(|| format!("open save file {:?}", path.as_ref()))?;
        let mut buffer = Vec::new();
        rdr.read_to_end(&mut buffer).context("read save file")?;
        let data: SaveData = bincode::deserialize(&buffer).context("decode save file")?;
        Ok(data)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let buffer = bincode::serialize(self).context("encode save data")?;
        let mut wtr = File::create(&path)
            .with_context(|| format!("create save file {:?}", path.as_ref()))?;
        wtr.write_all(&buffer).context("write save file")?;
        Ok(())
    }
}

impl Interpreter {
    /// Snapshot the persistent state.
    pub fn save_state(&self) -> SaveData {
        SaveData {
            globals: self.globals.clone(),
            flags: self.flags.clone(),
        }
    }

    /// Replace the persistent state. Call between scenes.
    pub fn restore_state(&mut self, data: SaveData) {
        self.globals = data.globals;
        self.flags = data.flags;
    }

    pub fn save_state_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.save_state().save_to_file(path)
    }

    pub fn load_state_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.restore_state(SaveData::load_from_file(path)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_data_round_trips_through_bincode() {
        let mut data = SaveData::default();
        data.globals
            .insert("gold".to_owned(), Variant::Int(120));
        data.flags.insert(
            "inventory".to_owned(),
            Variant::array(vec![Variant::from("sword"), Variant::Int(2)]),
        );

        let bytes = bincode::serialize(&data).unwrap();
        let back: SaveData = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.globals["gold"], Variant::Int(120));
        assert_eq!(
            back.flags["inventory"],
            Variant::array(vec![Variant::from("sword"), Variant::Int(2)])
        );
    }
}
