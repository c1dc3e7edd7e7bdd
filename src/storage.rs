//! Final buffer-to-file write. The engine hands back one fully verified
//! in-memory buffer; writing it out is a single collaborator call, not a
//! subsystem in its own right.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub fn write_output(path: impl AsRef<Path>, buffer: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(buffer)
}
