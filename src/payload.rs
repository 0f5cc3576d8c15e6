//! Wire format of the communication artifacts.
//!
//! A submitter writes one [`CallSpec`] per input artifact; a worker
//! writes one [`RunOutcome`] per output artifact. Argument and result
//! values travel as opaque blobs so the executor never needs to know
//! the caller's types.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("failed to encode payload")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode payload")]
    Decode(#[source] bincode::Error),
}

/// One call written to a worker's input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    /// Name the worker-side registry resolves to a task function.
    pub function: String,
    /// Work items executed by this worker, one for a plain submission,
    /// a whole batch for an array slot.
    pub items: Vec<WorkItem>,
}

/// A single work item: encoded arguments plus an optional encoded
/// context value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub args: Vec<u8>,
    pub context: Option<Vec<u8>>,
}

/// What a worker writes back: one result blob per item, or the
/// stringified failure that aborted the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success(Vec<Vec<u8>>),
    Failure(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    bincode::serialize(value).map_err(PayloadError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    bincode::deserialize(bytes).map_err(PayloadError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        let value = ("some-args".to_string(), vec![1u64, 2, 3]);
        let decoded: (String, Vec<u64>) = decode(&encode(&value).unwrap()).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn call_specs_round_trip() {
        let spec = CallSpec {
            function: "solve".to_string(),
            items: vec![
                WorkItem {
                    args: encode(&17i64).unwrap(),
                    context: None,
                },
                WorkItem {
                    args: encode(&18i64).unwrap(),
                    context: Some(encode(&"ctx").unwrap()),
                },
            ],
        };

        let decoded: CallSpec = decode(&encode(&spec).unwrap()).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn outcomes_round_trip() {
        let success = RunOutcome::Success(vec![encode(&1i64).unwrap()]);
        let failure = RunOutcome::Failure("stack trace".to_string());

        assert_eq!(
            decode::<RunOutcome>(&encode(&success).unwrap()).unwrap(),
            success
        );
        assert_eq!(
            decode::<RunOutcome>(&encode(&failure).unwrap()).unwrap(),
            failure
        );
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode::<RunOutcome>(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
