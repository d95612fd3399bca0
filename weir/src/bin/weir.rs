// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use weir::error::Error;
use weir::server::run::run_server;

fn main() -> Result<(), Error> {
    run_server()
}
