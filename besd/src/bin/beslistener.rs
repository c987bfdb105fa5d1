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

//! The bes master worker: binds the PPT data-channel listeners, drops
//! privileges, and forks a handler process per accepted connection.
//! Always launched by the supervisor, never directly by a user.

use clap::Parser;
use libbes::{CommonArgs, VERSION};

fn main() -> anyhow::Result<()> {
    let args = CommonArgs::parse();

    if args.version {
        println!("beslistener {VERSION}");
        return Ok(());
    }

    match libbes::run_master_worker(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("beslistener: {err:?}");
            std::process::exit(libbes::exit_code::ExitCode::FatalCanNotStart.as_raw());
        }
    }
}
