use colored::Colorize;

fn prefix() -> String {
    "[constellation]".bold().cyan().to_string()
}

/// Print an informational message: [constellation] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print a warning in yellow.
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}
