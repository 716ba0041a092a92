fn main() -> std::process::ExitCode {
    campp_launcher_lib::run()
}
