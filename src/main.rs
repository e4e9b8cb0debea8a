use colored::Colorize;

fn main() {
    match tractflow::run() {
        Ok(true) => (),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {e:?}", "ERROR:".red());
            std::process::exit(1);
        }
    }
}
