// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Mikaela Szekely <mikaela.szekely@qyriad.me>
// SPDX-FileContributor: Written by Piotr Esden-Tempski <piotr@esden.net>
// SPDX-FileContributor: Modified by Rachel Mant <git@dragonmux.network>
//! Fleet management for USB-attached Teensy-family development boards.
//!
//! [`manager`] discovers and aggregates USB interfaces into logical [`board::Board`]s as they
//! plug and unplug. [`task`] and [`pool`] dispatch long-running operations onto a worker pool.
//! [`upload`] drives firmware upload through whichever capability-bearing interface a board
//! currently exposes, waiting out bootloader transitions as necessary.

pub mod board;
pub mod capability;
pub mod error;
pub mod firmware_file;
pub mod interface;
pub mod manager;
pub mod message;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod task;
pub mod upload;
