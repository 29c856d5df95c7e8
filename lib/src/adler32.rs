// Copyright 2024 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Seedable Adler-32, used to hash diff tokens and delta match blocks.

const ADLER_MOD: u32 = 65521;

/// Extends the checksum `seed` with `bytes`. Pass 0 to start a new sum.
pub fn adler32(seed: u32, bytes: &[u8]) -> u32 {
    let mut a = seed & 0xffff;
    let mut b = seed >> 16;
    for &c in bytes {
        a = (a + u32::from(c)) % ADLER_MOD;
        b = (b + a) % ADLER_MOD;
    }
    (b << 16) | a
}
