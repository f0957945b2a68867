//! Device-Control Server Access
//!
//! Every instrument in the system (camera, phase loop controller, telescope,
//! filter wheels) is reached through named properties on an external
//! device-control server. A property element is addressed as
//! `Device.Property.Element`, e.g. `NOMIC.CamInfo.IntTime`.
//!
//! This module defines:
//! - `PropertyPath` / `PropertyValue` / `PropertyUpdate`: the property model
//! - `PropertyClient`: the async seam a server client implements
//! - `capabilities`: fine-grained instrument traits used by procedures
//! - `simulated`: an in-process server with a physical model of the null
//!
//! The wire protocol of the real server is out of scope; anything that can
//! get and set properties can implement `PropertyClient`.
//!
//! # Example
//!
//! ```rust,ignore
//! use nomic_ops::device::{PropertyClient, PropertyUpdate};
//!
//! let dit = client.get_number("NOMIC.CamInfo.IntTime").await?;
//! client
//!     .set(
//!         PropertyUpdate::new("PLC", "PLSetpoint")
//!             .number("PLSetpoint", 120.0)
//!             .number("forNAC", 0.0),
//!     )
//!     .await?;
//! ```

pub mod capabilities;
pub mod simulated;

use crate::error::NomicError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Property Model
// =============================================================================

/// Fully-qualified property element address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyPath {
    /// Device name (e.g. "NOMIC")
    pub device: String,
    /// Property name (e.g. "CamInfo")
    pub property: String,
    /// Element name (e.g. "IntTime")
    pub element: String,
}

impl PropertyPath {
    /// Build a path from its three parts.
    pub fn new(
        device: impl Into<String>,
        property: impl Into<String>,
        element: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
            element: element.into(),
        }
    }

    /// `Device.Property` without the element.
    pub fn property_key(&self) -> String {
        format!("{}.{}", self.device, self.property)
    }
}

impl FromStr for PropertyPath {
    type Err = NomicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Element names never contain dots; device and property names do not either.
        let mut parts = s.splitn(3, '.');
        let (Some(device), Some(property), Some(element)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(NomicError::InvalidPath(s.to_string()));
        };
        if device.is_empty() || property.is_empty() || element.is_empty() || element.contains('.')
        {
            return Err(NomicError::InvalidPath(s.to_string()));
        }
        Ok(Self::new(device, property, element))
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.device, self.property, self.element)
    }
}

/// Value held by a property element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Numeric element
    Number(f64),
    /// Text element
    Text(String),
    /// Switch (On/Off) element
    Switch(bool),
}

impl PropertyValue {
    /// Name of the value kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Number(_) => "number",
            PropertyValue::Text(_) => "text",
            PropertyValue::Switch(_) => "switch",
        }
    }

    /// Numeric value, or `TypeMismatch`.
    pub fn as_number(&self, path: &PropertyPath) -> Result<f64, NomicError> {
        match self {
            PropertyValue::Number(v) => Ok(*v),
            other => Err(mismatch(path, "number", other)),
        }
    }

    /// Text value, or `TypeMismatch`.
    pub fn as_text(&self, path: &PropertyPath) -> Result<&str, NomicError> {
        match self {
            PropertyValue::Text(v) => Ok(v.as_str()),
            other => Err(mismatch(path, "text", other)),
        }
    }

    /// Switch value, or `TypeMismatch`.
    pub fn as_switch(&self, path: &PropertyPath) -> Result<bool, NomicError> {
        match self {
            PropertyValue::Switch(v) => Ok(*v),
            other => Err(mismatch(path, "switch", other)),
        }
    }
}

fn mismatch(path: &PropertyPath, expected: &'static str, actual: &PropertyValue) -> NomicError {
    NomicError::TypeMismatch {
        path: path.to_string(),
        expected,
        actual: actual.kind(),
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Number(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => write!(f, "{}", v),
            PropertyValue::Switch(true) => write!(f, "On"),
            PropertyValue::Switch(false) => write!(f, "Off"),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Switch(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Atomic update of one or more elements of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    /// Device name
    pub device: String,
    /// Property name
    pub property: String,
    /// Element values, in the order given
    pub elements: Vec<(String, PropertyValue)>,
}

impl PropertyUpdate {
    /// Start an update of `device.property`.
    pub fn new(device: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
            elements: Vec::new(),
        }
    }

    /// Single-element update addressed by a full path.
    pub fn single(path: &PropertyPath, value: impl Into<PropertyValue>) -> Self {
        Self::new(path.device.clone(), path.property.clone()).element(path.element.clone(), value)
    }

    /// Add an element value.
    pub fn element(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.elements.push((name.into(), value.into()));
        self
    }

    /// Add a numeric element.
    pub fn number(self, name: impl Into<String>, value: f64) -> Self {
        self.element(name, PropertyValue::Number(value))
    }

    /// Add a text element.
    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.element(name, PropertyValue::Text(value.into()))
    }

    /// Add a switch element.
    pub fn switch(self, name: impl Into<String>, on: bool) -> Self {
        self.element(name, PropertyValue::Switch(on))
    }

    /// `Device.Property` being updated.
    pub fn property_key(&self) -> String {
        format!("{}.{}", self.device, self.property)
    }

    /// Value given for `element`, if any.
    pub fn get(&self, element: &str) -> Option<&PropertyValue> {
        self.elements
            .iter()
            .find(|(name, _)| name == element)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for PropertyUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.", self.device, self.property)?;
        for (i, (name, value)) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

// =============================================================================
// PropertyClient
// =============================================================================

/// Access to a device-control server.
///
/// # Contract
/// - `get` returns the current value of one element
/// - `set` returns once the server has accepted the update; for commands that
///   trigger work (camera `go`) it returns when that work has completed
/// - Implementations are shared across tasks (`Send + Sync`, `&self` methods)
#[async_trait]
pub trait PropertyClient: Send + Sync {
    /// Read one property element.
    async fn get(&self, path: &PropertyPath) -> Result<PropertyValue>;

    /// Write one or more elements of a property.
    async fn set(&self, update: PropertyUpdate) -> Result<()>;

    /// Read a numeric element addressed by a dotted path.
    async fn get_number(&self, path: &str) -> Result<f64> {
        let path: PropertyPath = path.parse()?;
        Ok(self.get(&path).await?.as_number(&path)?)
    }

    /// Read a text element addressed by a dotted path.
    async fn get_text(&self, path: &str) -> Result<String> {
        let path: PropertyPath = path.parse()?;
        Ok(self.get(&path).await?.as_text(&path)?.to_string())
    }

    /// Read a switch element addressed by a dotted path.
    async fn get_switch(&self, path: &str) -> Result<bool> {
        let path: PropertyPath = path.parse()?;
        Ok(self.get(&path).await?.as_switch(&path)?)
    }

    /// Write a single numeric element.
    async fn set_number(&self, path: &str, value: f64) -> Result<()> {
        let path: PropertyPath = path.parse()?;
        self.set(PropertyUpdate::single(&path, value)).await
    }

    /// Write a single text element.
    async fn set_text(&self, path: &str, value: &str) -> Result<()> {
        let path: PropertyPath = path.parse()?;
        self.set(PropertyUpdate::single(&path, value)).await
    }

    /// Write a single switch element.
    async fn set_switch(&self, path: &str, on: bool) -> Result<()> {
        let path: PropertyPath = path.parse()?;
        self.set(PropertyUpdate::single(&path, on)).await
    }

    /// Poll `path` until `predicate` holds or `timeout` elapses.
    ///
    /// Returns the value that satisfied the predicate.
    async fn wait_until(
        &self,
        path: &str,
        predicate: &(dyn for<'v> Fn(&'v PropertyValue) -> bool + Send + Sync),
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PropertyValue> {
        let parsed: PropertyPath = path.parse()?;
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.get(&parsed).await?;
            if predicate(&value) {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(NomicError::Timeout {
                    what: path.to_string(),
                    seconds: timeout.as_secs_f64(),
                }
                .into());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_path() {
        let p: PropertyPath = "NOMIC.CamInfo.IntTime".parse().unwrap();
        assert_eq!(p.device, "NOMIC");
        assert_eq!(p.property, "CamInfo");
        assert_eq!(p.element, "IntTime");
        assert_eq!(p.to_string(), "NOMIC.CamInfo.IntTime");
        assert_eq!(p.property_key(), "NOMIC.CamInfo");
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["NOMIC", "NOMIC.CamInfo", "NOMIC..IntTime", ".a.b", "a.b.c.d"] {
            assert!(
                matches!(bad.parse::<PropertyPath>(), Err(NomicError::InvalidPath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn typed_accessors_report_mismatch() {
        let path = PropertyPath::new("PLC", "CloseLoop", "Yes");
        let value = PropertyValue::Switch(true);
        assert!(value.as_switch(&path).unwrap());
        match value.as_number(&path) {
            Err(NomicError::TypeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "number");
                assert_eq!(actual, "switch");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn update_formats_like_server_syntax() {
        let update = PropertyUpdate::new("PLC", "PLSetpoint")
            .number("PLSetpoint", 12.5)
            .number("forNAC", 0.0);
        assert_eq!(update.to_string(), "PLC.PLSetpoint.PLSetpoint=12.5;forNAC=0");
        assert_eq!(update.get("forNAC"), Some(&PropertyValue::Number(0.0)));
        assert!(update.get("missing").is_none());
    }
}
