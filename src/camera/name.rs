//! Logical camera identities

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CameraError;

const VENDOR_PRODUCT_PREFIX: &str = "VendorProduct:";

/// Identity of a USB device.
///
/// Devices that report a hardware serial number are identified by it. Devices
/// that lack one get a synthetic vendor/product identity qualified by the
/// port they are plugged into; dropping the connection path turns that
/// identity into a wildcard matching any device with the same vendor/product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SerialNumber {
    Usb(String),
    VendorProduct {
        vendor_id: u16,
        product_id: u16,
        connection_path: Option<String>,
    },
}

impl SerialNumber {
    pub fn usb(serial: impl Into<String>) -> Self {
        Self::Usb(serial.into())
    }

    pub fn vendor_product(vendor_id: u16, product_id: u16, connection_path: Option<String>) -> Self {
        Self::VendorProduct {
            vendor_id,
            product_id,
            connection_path: connection_path.filter(|path| !path.is_empty()),
        }
    }

    pub fn is_vendor_product(&self) -> bool {
        matches!(self, Self::VendorProduct { .. })
    }

    /// A vendor/product identity without a connection path
    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            Self::VendorProduct {
                connection_path: None,
                ..
            }
        )
    }

    /// The wildcard form of a vendor/product identity; real serials are unchanged.
    pub fn to_wildcard(&self) -> Self {
        match self {
            Self::Usb(_) => self.clone(),
            Self::VendorProduct {
                vendor_id,
                product_id,
                ..
            } => Self::vendor_product(*vendor_id, *product_id, None),
        }
    }

    /// Whether this (concrete) identity is matched by `pattern`.
    pub fn matches(&self, pattern: &SerialNumber) -> bool {
        match (self, pattern) {
            (Self::Usb(ours), Self::Usb(theirs)) => ours == theirs,
            (
                Self::VendorProduct {
                    vendor_id,
                    product_id,
                    connection_path,
                },
                Self::VendorProduct {
                    vendor_id: pattern_vendor,
                    product_id: pattern_product,
                    connection_path: pattern_path,
                },
            ) => {
                vendor_id == pattern_vendor
                    && product_id == pattern_product
                    && (pattern_path.is_none() || pattern_path == connection_path)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb(serial) => f.write_str(serial),
            Self::VendorProduct {
                vendor_id,
                product_id,
                connection_path,
            } => {
                write!(f, "{VENDOR_PRODUCT_PREFIX}{vendor_id:04X}|{product_id:04X}")?;
                if let Some(path) = connection_path {
                    write!(f, "|{path}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for SerialNumber {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CameraError::InvalidName("empty serial number".into()));
        }
        let Some(rest) = s.strip_prefix(VENDOR_PRODUCT_PREFIX) else {
            return Ok(Self::Usb(s.to_string()));
        };

        let mut parts = rest.splitn(3, '|');
        let parse_id = |part: Option<&str>| {
            part.and_then(|hex| u16::from_str_radix(hex, 16).ok())
                .ok_or_else(|| CameraError::InvalidName(s.to_string()))
        };
        let vendor_id = parse_id(parts.next())?;
        let product_id = parse_id(parts.next())?;
        let connection_path = parts.next().map(str::to_string);
        Ok(Self::vendor_product(vendor_id, product_id, connection_path))
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = CameraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SerialNumber> for String {
    fn from(serial: SerialNumber) -> Self {
        serial.to_string()
    }
}

/// Which way a built-in camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraDirection {
    Back,
    Front,
}

/// Stable logical identity of a camera. Carries no open resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CameraName {
    Webcam(SerialNumber),
    Builtin(CameraDirection),
    /// One logical camera over several members, never nested.
    Switchable(Vec<CameraName>),
    Unknown,
}

impl CameraName {
    pub fn webcam(serial: SerialNumber) -> Self {
        Self::Webcam(serial)
    }

    pub fn builtin(direction: CameraDirection) -> Self {
        Self::Builtin(direction)
    }

    /// Builds a composite name. Nested composites are flattened and duplicate
    /// members dropped, keeping first-seen order.
    pub fn switchable<I>(names: I) -> Result<Self, CameraError>
    where
        I: IntoIterator<Item = CameraName>,
    {
        let mut members = Vec::new();
        for name in names {
            flatten_into(&mut members, name)?;
        }
        if members.is_empty() {
            return Err(CameraError::InvalidName(
                "the list of camera names cannot be empty".into(),
            ));
        }
        Ok(Self::Switchable(members))
    }

    pub fn is_webcam(&self) -> bool {
        matches!(self, Self::Webcam(_))
    }

    pub fn is_switchable(&self) -> bool {
        matches!(self, Self::Switchable(_))
    }

    pub fn serial_number(&self) -> Option<&SerialNumber> {
        match self {
            Self::Webcam(serial) => Some(serial),
            _ => None,
        }
    }

    /// Members of a composite; a plain name is its own sole member.
    pub fn members(&self) -> &[CameraName] {
        match self {
            Self::Switchable(members) => members,
            _ => std::slice::from_ref(self),
        }
    }
}

fn flatten_into(members: &mut Vec<CameraName>, name: CameraName) -> Result<(), CameraError> {
    match name {
        CameraName::Switchable(nested) => {
            for member in nested {
                flatten_into(members, member)?;
            }
        }
        CameraName::Unknown => {
            return Err(CameraError::InvalidName(
                "a switchable member cannot be unknown".into(),
            ));
        }
        other => {
            if !members.contains(&other) {
                members.push(other);
            }
        }
    }
    Ok(())
}

impl fmt::Display for CameraName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webcam(serial) => write!(f, "Webcam({serial})"),
            Self::Builtin(CameraDirection::Back) => f.write_str("Builtin(back)"),
            Self::Builtin(CameraDirection::Front) => f.write_str("Builtin(front)"),
            Self::Switchable(members) => {
                f.write_str("Switchable(")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{member}")?;
                }
                f.write_str(")")
            }
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}
