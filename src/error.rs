// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Common error type for the simulation library.
//!
//! All fallible operations return [`Result`]. Device failures are fatal for
//! the current graph run but leave the process usable; scene mutations are
//! transactional per call and roll back on failure.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for scene, graph and device operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed input from the caller (null-ish, wrong size, NaN where
    /// disallowed).
    InvalidArgument(String),
    /// Graph-level problem: cycle, missing input, field mismatch, or an
    /// input that is not device-accessible where it must be.
    InvalidPipeline(String),
    /// Mesh or acceleration-structure build input problem.
    InvalidGeometry(String),
    /// CUDA or OptiX failure, with the vendor error text.
    Device(String),
    /// Device memory allocation failed.
    OutOfMemory,
    /// The device layer has not been (or could not be) initialized.
    NotInitialized(String),
    /// Logging or device layer was initialized twice.
    AlreadyInitialized,
    /// The graph run was cancelled before this operation completed.
    Cancelled,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::InvalidPipeline(msg) => write!(f, "invalid pipeline: {}", msg),
            Error::InvalidGeometry(msg) => write!(f, "invalid geometry: {}", msg),
            Error::Device(msg) => write!(f, "device error: {}", msg),
            Error::OutOfMemory => write!(f, "out of device memory"),
            Error::NotInitialized(msg) => write!(f, "not initialized: {}", msg),
            Error::AlreadyInitialized => write!(f, "already initialized"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl From<cust::error::CudaError> for Error {
    fn from(err: cust::error::CudaError) -> Self {
        match err {
            cust::error::CudaError::OutOfMemory => Error::OutOfMemory,
            other => Error::Device(format!("CUDA: {}", other)),
        }
    }
}

impl From<optix::error::Error> for Error {
    fn from(err: optix::error::Error) -> Self {
        Error::Device(format!("OptiX: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::InvalidPipeline("cycle detected at raytrace#2".into());
        assert_eq!(
            err.to_string(),
            "invalid pipeline: cycle detected at raytrace#2"
        );
        assert_eq!(Error::OutOfMemory.to_string(), "out of device memory");
    }
}
