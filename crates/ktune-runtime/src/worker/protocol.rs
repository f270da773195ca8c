use super::{BenchmarkRequest, WorkerError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Message sent by the pool to a worker, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Benchmark a candidate.
    Benchmark {
        /// The job.
        request: BenchmarkRequest,
    },
    /// Exit cleanly.
    Shutdown,
}

/// Message sent by a worker to the pool, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Sent once when the worker is ready to accept requests.
    Ready {
        /// The device the worker is bound to.
        device: Option<u32>,
        /// The worker process id.
        pid: u32,
    },
    /// Result of a benchmark. `None` means the candidate failed, i.e. `+inf`.
    Timing {
        /// Latency in milliseconds.
        latency_ms: Option<f64>,
        /// The device the worker is bound to.
        device: Option<u32>,
    },
    /// The request couldn't be executed by this worker.
    Rejected {
        /// Why the request was rejected.
        reason: String,
        /// The device the worker is bound to.
        device: Option<u32>,
    },
}

impl WorkerReply {
    /// A timing reply, encoding non-finite latencies as a failure.
    pub fn timing(latency_ms: f64, device: Option<u32>) -> Self {
        WorkerReply::Timing {
            latency_ms: latency_ms.is_finite().then_some(latency_ms),
            device,
        }
    }
}

/// Encode a message as a single line, terminated by `\n`.
pub fn encode<T: Serialize>(message: &T) -> Result<String, WorkerError> {
    let mut line = serde_json::to_string(message).map_err(|err| WorkerError::Protocol {
        reason: err.to_string(),
    })?;
    line.push('\n');
    Ok(line)
}

/// Decode a message from a single line.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, WorkerError> {
    serde_json::from_str(line.trim()).map_err(|err| WorkerError::Protocol {
        reason: format!("{err} in {:?}", line.trim()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn infinite_latency_is_sent_as_null() {
        let line = encode(&WorkerReply::timing(f64::INFINITY, Some(1))).unwrap();

        assert_eq!(
            line,
            "{\"type\":\"timing\",\"latency_ms\":null,\"device\":1}\n"
        );
        assert_eq!(
            decode::<WorkerReply>(&line).unwrap(),
            WorkerReply::Timing {
                latency_ms: None,
                device: Some(1)
            }
        );
    }

    #[test_log::test]
    fn garbage_is_a_protocol_error() {
        let result = decode::<WorkerReply>("Segmentation fault (core dumped)");

        assert!(matches!(result, Err(WorkerError::Protocol { .. })));
    }
}
