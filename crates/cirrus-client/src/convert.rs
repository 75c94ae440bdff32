//! Conversions between domain types and the wire schema

use crate::node::{MemberDigest, MemberInfo};
use cirrus_common::{Error, MemberStatus, NodeId};
use cirrus_proto::storage as pb;
use tonic::{Code, Status};
use tracing::warn;

/// Map a domain error onto a gRPC status
#[must_use]
pub fn status_from_error(err: &Error) -> Status {
    match err {
        Error::InvalidInput(msg) => Status::invalid_argument(msg.clone()),
        Error::NotFound(_) | Error::ObjectNotFound { .. } => Status::not_found(err.to_string()),
        Error::Forbidden(msg) => Status::permission_denied(msg.clone()),
        Error::Unauthorized(msg) => Status::unauthenticated(msg.clone()),
        Error::Conflict(msg) => Status::already_exists(msg.clone()),
        Error::Internal { message, .. } => Status::internal(message.clone()),
    }
}

/// Map a gRPC status back onto a domain error
#[must_use]
pub fn error_from_status(status: Status) -> Error {
    let message = status.message().to_string();
    match status.code() {
        Code::InvalidArgument => Error::InvalidInput(message),
        Code::NotFound => Error::NotFound(message),
        Code::PermissionDenied => Error::Forbidden(message),
        Code::Unauthenticated => Error::Unauthorized(message),
        Code::AlreadyExists => Error::Conflict(message),
        code => Error::internal_with(format!("rpc failed ({code:?}): {message}"), status),
    }
}

/// Membership status as carried in a digest
#[must_use]
pub const fn status_to_wire(status: MemberStatus) -> pb::MemberStatus {
    match status {
        MemberStatus::Alive => pb::MemberStatus::Alive,
        MemberStatus::Suspect => pb::MemberStatus::Suspect,
        MemberStatus::Dead => pb::MemberStatus::Dead,
    }
}

#[must_use]
pub const fn status_from_wire(status: pb::MemberStatus) -> MemberStatus {
    match status {
        pb::MemberStatus::Alive => MemberStatus::Alive,
        pb::MemberStatus::Suspect => MemberStatus::Suspect,
        pb::MemberStatus::Dead => MemberStatus::Dead,
    }
}

impl From<&MemberDigest> for pb::MemberDigest {
    fn from(digest: &MemberDigest) -> Self {
        Self {
            id: digest.id.to_string(),
            incarnation: digest.incarnation,
            status: status_to_wire(digest.status).into(),
            address: digest.address.clone(),
        }
    }
}

impl TryFrom<pb::MemberDigest> for MemberDigest {
    type Error = Error;

    fn try_from(digest: pb::MemberDigest) -> Result<Self, Error> {
        if digest.id.is_empty() {
            return Err(Error::invalid_input("member digest without id"));
        }
        let status = pb::MemberStatus::try_from(digest.status).map_err(|_| {
            Error::invalid_input(format!("unknown member status {}", digest.status))
        })?;
        Ok(Self {
            id: NodeId::new(digest.id),
            incarnation: digest.incarnation,
            status: status_from_wire(status),
            address: digest.address,
        })
    }
}

/// Decode a digest list, dropping malformed entries
pub fn digests_from_wire(members: Vec<pb::MemberDigest>) -> Vec<MemberDigest> {
    members
        .into_iter()
        .filter_map(|m| match MemberDigest::try_from(m) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(error = %e, "ignoring malformed member digest");
                None
            }
        })
        .collect()
}

impl From<&MemberInfo> for pb::MemberInfo {
    fn from(info: &MemberInfo) -> Self {
        Self {
            address: info.address.clone(),
            status: info.status.as_str().to_string(),
            last_heartbeat: info.last_heartbeat,
        }
    }
}

impl TryFrom<pb::MemberInfo> for MemberInfo {
    type Error = Error;

    fn try_from(info: pb::MemberInfo) -> Result<Self, Error> {
        Ok(Self {
            status: info.status.parse()?,
            address: info.address,
            last_heartbeat: info.last_heartbeat,
        })
    }
}
