/*
[INPUT]:  Caller intent for a privileged REST call
[OUTPUT]: SignedRequestSpec consumed once by the request sender
[POS]:    Data layer - request descriptions
[UPDATE]: When request shape or defaults change
*/

use reqwest::Method;

/// Description of one signed REST call
///
/// `timestamp` and `signature` are added at send time by the signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequestSpec {
    pub method: Method,
    pub path: String,
    /// Ordered parameters, encoded in this order
    pub params: Vec<(String, String)>,
    /// Overrides the client default when set
    pub recv_window: Option<u64>,
}

impl SignedRequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            recv_window: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn recv_window(mut self, millis: u64) -> Self {
        self.recv_window = Some(millis);
        self
    }
}
