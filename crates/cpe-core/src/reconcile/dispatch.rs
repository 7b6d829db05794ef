//! Untyped entry points for the Control API
//!
//! The API only knows the kind segment of the path and a JSON body; this
//! module picks the concrete object type and forwards to the typed calls.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Reconciler;
use crate::error::{Error, Result};
use crate::model::{
    BgpConf, CheckConf, ConnConf, DhcpConf, DnsConf, GeneralConf, HaConf, Kind, PortConf,
    SiteConf, StaticConf, SubnetConf,
};

/// One single-object call
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRequest {
    /// POST on a collection kind
    Create(Value),
    /// PUT on a collection kind
    Modify(Value),
    /// DELETE on a collection kind
    Delete(String),
    /// PUT on a singleton kind
    Put(Value),
}

fn decode<T: DeserializeOwned>(kind: Kind, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::invalid_input(format!("malformed {} body: {}", kind, e)))
}

macro_rules! collection {
    ($self:ident, $ty:ty, $kind:expr, $req:expr) => {
        match $req {
            ObjectRequest::Create(body) => $self.create(&decode::<$ty>($kind, body)?).await,
            ObjectRequest::Modify(body) => $self.modify(&decode::<$ty>($kind, body)?).await,
            ObjectRequest::Delete(id) => $self.delete::<$ty>(&id).await,
            ObjectRequest::Put(_) => Err(Error::invalid_input(format!(
                "{} is a collection; use POST or PUT with an id",
                $kind
            ))),
        }
    };
}

macro_rules! singleton {
    ($self:ident, $ty:ty, $kind:expr, $req:expr) => {
        match $req {
            ObjectRequest::Put(body) | ObjectRequest::Modify(body) => {
                $self.put(&decode::<$ty>($kind, body)?).await
            }
            _ => Err(Error::invalid_input(format!("{} only supports PUT", $kind))),
        }
    };
}

impl Reconciler {
    /// Route a single-object call to the typed operation for `kind`
    pub async fn handle(&self, kind: Kind, request: ObjectRequest) -> Result<()> {
        match kind {
            Kind::Port => collection!(self, PortConf, kind, request),
            Kind::Subnet => collection!(self, SubnetConf, kind, request),
            Kind::Static => collection!(self, StaticConf, kind, request),
            Kind::Check => collection!(self, CheckConf, kind, request),
            Kind::Conn => collection!(self, ConnConf, kind, request),
            Kind::Bgp => singleton!(self, BgpConf, kind, request),
            Kind::Dns => singleton!(self, DnsConf, kind, request),
            Kind::Dhcp => singleton!(self, DhcpConf, kind, request),
            Kind::Ha => singleton!(self, HaConf, kind, request),
            Kind::General => singleton!(self, GeneralConf, kind, request),
            Kind::Site => singleton!(self, SiteConf, kind, request),
        }
    }
}
