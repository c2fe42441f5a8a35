// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaError {
    #[error("{call} failed: {status}")]
    Status { call: &'static str, status: String },
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no VA device available")]
    NoDevice,
    #[error("ran out of {0}")]
    Exhausted(&'static str),
}

impl VaError {
    pub fn status(call: &'static str, status: impl Into<String>) -> Self {
        VaError::Status {
            call,
            status: status.into(),
        }
    }
}

impl From<VaError> for gst::LoggableError {
    fn from(err: VaError) -> Self {
        gst::loggable_error!(crate::CAT, "{}", err)
    }
}
