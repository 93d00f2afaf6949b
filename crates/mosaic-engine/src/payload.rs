use std::io;

use mosaic_contracts::parts::ImagePart;
use mosaic_contracts::relay::StitchRequest;

use crate::error::StitchError;

/// Exact UTF-8 byte length of `{"images": parts, "baseImage": composite}` as
/// it goes over the wire. Planner, estimator and orchestrator all size
/// batches through this one function.
pub fn measure(parts: &[ImagePart], composite: Option<&ImagePart>) -> Result<usize, StitchError> {
    let mut counter = ByteCounter::default();
    serde_json::to_writer(&mut counter, &StitchRequest::new(parts, composite))?;
    Ok(counter.bytes)
}

#[derive(Debug, Default)]
struct ByteCounter {
    bytes: usize,
}

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
