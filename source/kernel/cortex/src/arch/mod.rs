// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture specific support code
//! OWNERS: @kernel-arch-team
//! PUBLIC API: arch backends under `arch::<isa>`
//! INVARIANTS: Only built for the bare-metal target; host builds drive `Kernel` directly

pub mod riscv;
