// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cli;
