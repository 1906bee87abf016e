//! Pairing two flow-controlled buffers into a duplex pipe.

use super::buffer::{pipe, PipeControl, PipeReader, PipeWriter, Watermarks};
use crate::pool::SegmentPool;

/// The ends the transport pumps: network bytes go into `input`, bytes for
/// the network come out of `output`.
#[derive(Debug)]
pub struct TransportPipe {
    pub input: PipeWriter,
    pub output: PipeReader,
}

/// The ends handed to the protocol layer.
#[derive(Debug)]
pub struct ApplicationPipe {
    pub input: PipeReader,
    pub output: PipeWriter,
}

/// Teardown handles for both directions.
#[derive(Debug, Clone)]
pub struct DuplexControl {
    input: PipeControl,
    output: PipeControl,
}

impl DuplexControl {
    /// Cancel both directions.
    pub fn cancel(&self) {
        self.input.cancel();
        self.output.cancel();
    }

    /// Complete both directions and return their segments to the pool.
    pub fn release(&self) {
        self.input.release();
        self.output.release();
    }

    pub fn input(&self) -> &PipeControl {
        &self.input
    }

    pub fn output(&self) -> &PipeControl {
        &self.output
    }
}

/// Two independent byte channels sharing one segment pool.
#[derive(Debug)]
pub struct DuplexPipe {
    pub transport: TransportPipe,
    pub application: ApplicationPipe,
    pub control: DuplexControl,
}

impl DuplexPipe {
    pub fn new(pool: &SegmentPool, input: Watermarks, output: Watermarks) -> Self {
        let (input_writer, input_reader, input_control) = pipe(pool.clone(), input);
        let (output_writer, output_reader, output_control) = pipe(pool.clone(), output);

        Self {
            transport: TransportPipe {
                input: input_writer,
                output: output_reader,
            },
            application: ApplicationPipe {
                input: input_reader,
                output: output_writer,
            },
            control: DuplexControl {
                input: input_control,
                output: output_control,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeError;

    #[tokio::test]
    async fn directions_are_independent() {
        let pool = SegmentPool::new(8, 4);
        let DuplexPipe {
            mut transport,
            mut application,
            control,
        } = DuplexPipe::new(&pool, Watermarks::unbounded(), Watermarks::unbounded());

        transport.input.append(b"request").unwrap();
        application.output.append(b"response").unwrap();

        let inbound = application.input.read().await.unwrap();
        let outbound = transport.output.read().await.unwrap();
        assert_eq!(inbound.buffer.to_vec(), b"request");
        assert_eq!(outbound.buffer.to_vec(), b"response");

        // Completing one direction leaves the other open.
        transport.input.complete();
        assert!(application.input.read().await.unwrap().is_completed);
        assert!(!transport.output.read().await.unwrap().is_completed);
        assert_eq!(control.output().unconsumed(), 8);
    }

    #[tokio::test]
    async fn cancel_reaches_both_directions() {
        let pool = SegmentPool::new(8, 4);
        let DuplexPipe {
            mut transport,
            mut application,
            control,
        } = DuplexPipe::new(&pool, Watermarks::unbounded(), Watermarks::unbounded());

        control.cancel();
        assert_eq!(application.input.read().await.unwrap_err(), PipeError::Canceled);
        assert_eq!(transport.output.read().await.unwrap_err(), PipeError::Canceled);
    }
}
