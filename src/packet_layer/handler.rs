//! Callbacks for packets streamed back while a request is outstanding.

use super::PullHeader;
use crate::error::Result;

/// Receives the unsolicited packets belonging to the current request.
///
/// Errors returned from the file callbacks fail the request once its ack
/// arrives; later packets of the same request are no longer delivered.
pub trait ResponseHandler {
    fn on_stdout(&mut self, _data: &[u8]) {}

    fn on_stderr(&mut self, _data: &[u8]) {}

    fn on_pull_header(&mut self, _header: &PullHeader) -> Result<()> {
        Ok(())
    }

    fn on_pull_data(&mut self, _offset: u32, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResponseHandler;

impl ResponseHandler for NoResponseHandler {}

/// Collects command output in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ResponseHandler for CapturedOutput {
    fn on_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    fn on_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }
}
