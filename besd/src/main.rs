// Copyright 2024 BES Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bes supervisor: launches and relaunches the master worker and
//! hosts the admin command channel. See the README for the full
//! [the README](https://github.com/OPENDAP/bes) for background on the
//! original server this reimplements.

use clap::Parser;
use libbes::{CommonArgs, VERSION};

fn main() -> anyhow::Result<()> {
    let args = CommonArgs::parse();

    if args.version {
        println!("besd {VERSION}");
        return Ok(());
    }

    if let Err(err) = libbes::run_supervisor(args) {
        eprintln!("besd: {err:?}");
        std::process::exit(1);
    }
    Ok(())
}
