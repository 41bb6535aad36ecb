use kernelplan_compiler::run_from_args;

fn main() {
    std::process::exit(run_from_args(std::env::args_os()));
}
