//! Queue, prefetch and playback orchestration for media clients.
//!
//! Given an ordered collection of remote media items, `spool` fetches their
//! content into local storage in the background, tracks the download state
//! of every item and drives a single playback session across the queue.
//!
//! The moving parts, from the leaves up:
//!
//! * [`item`]: immutable descriptions of catalog entries
//! * [`unit`]: download units and their lifecycle
//! * [`queue`]: the ordered queue with its cursor
//! * [`coordinator`]: the bounded pool of fetch workers
//! * [`controller`]: the player state machine
//! * [`service`]: the façade composing the above
//!
//! Catalogs, storage and playback engines are collaborators behind the
//! [`catalog::Catalog`], [`storage::Storage`] and [`engine::Engine`] traits.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod catalog;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod item;
pub mod queue;
pub mod service;
pub mod storage;
pub mod unit;
