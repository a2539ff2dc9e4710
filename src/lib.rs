//! Client library for a hand-tracking service.
//!
//! A [`Connection`] runs one dedicated thread that polls a
//! [`TrackingBackend`], decodes the flat native records it produces into
//! immutable [`Frame`] snapshot graphs, and publishes typed [`SdkEvent`]s.
//! Consumers read frames from a short history ring, request sensor images
//! into pooled buffers, and optionally view everything through a lazy
//! [`TransformedFrame`] overlay that re-projects the data into their own
//! coordinate space.
//!
//! The [`SimulatedBackend`] synthesizes plausible tracking data for running
//! without the native service.

pub mod anatomy;
pub mod config;
pub mod connection;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod factory;
pub mod geometry;
pub mod image;
pub mod pending;
pub mod pool;
pub mod ring;
pub mod service;
pub mod sim;
pub mod transformed;

pub use anatomy::{Arm, Bone, BoneType, Finger, FingerType, Frame, Hand, InteractionBox};
pub use connection::Connection;
pub use controller::{Config, ConnectionRegistry, Controller};
pub use device::{Device, DeviceList};
pub use error::{Error, Result};
pub use events::{ImageFailureReason, ImageRequestFailure, SdkEvent, SubscriptionId};
pub use geometry::{Basis, Transform, Vec3};
pub use image::{DistortionData, Image, ImageFormat, ImageKind};
pub use service::{
    policy, ConfigParam, ConfigValue, LogSeverity, ServiceError, ServiceResult, TrackingBackend,
};
pub use sim::SimulatedBackend;
pub use transformed::{
    BoneView, FingerView, HandView, TransformedArm, TransformedBone, TransformedFinger,
    TransformedFrame, TransformedHand,
};
