// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Trap implementations return `Result<NextTask, UserError>`, keeping the
//! business of recording an error in the caller's registers (or faulting the
//! caller) in one place, the dispatcher.

use abi::{FaultInfo, ResponseCode, UsageError};

use crate::task::NextTask;

/// An error committed by task code when interacting with a trap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant task
    /// by returning a negative status in its first result register. They may
    /// still cause a context switch, as indicated by the `NextTask`.
    Recoverable(ResponseCode, NextTask),
    /// An unrecoverable error. These are translated into faults against the
    /// errant task, which ends it.
    Unrecoverable(FaultInfo),
}

impl From<ResponseCode> for UserError {
    fn from(rc: ResponseCode) -> Self {
        Self::Recoverable(rc, NextTask::Same)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
