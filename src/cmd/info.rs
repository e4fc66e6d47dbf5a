//! Informational commands - `reshard-phase concurrency` and `reshard-phase phases`.

use reshard_phase::fanout::concurrency_for;
use reshard_phase::phases::PhaseName;

pub fn cmd_concurrency(instances: usize) {
    println!("{}", concurrency_for(instances));
}

pub fn cmd_phases() {
    for phase in PhaseName::ALL {
        println!("{:<34} {}", phase.as_str(), phase.description());
    }
}
