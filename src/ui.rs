use colored::*;
use figlet_rs::FIGfont;
use rustyline::DefaultEditor;
use toba_core::constants::{APP_NAME, VERSION};

pub const WARNING_TEXTS: &[&str] = &[
    "Flashing the wrong image can leave the device unbootable.",
    "Back up the baseband partitions before touching modem or persist.",
];

pub fn banner() {
    let font = FIGfont::standard().ok();
    match font.as_ref().and_then(|f| f.convert(APP_NAME)) {
        Some(art) => println!("{}", art.to_string().cyan()),
        None => println!("{}", APP_NAME.cyan().bold()),
    }
    println!("version: {}", VERSION.yellow());
    let divider = divider();
    println!("{}", divider);
    for warning in WARNING_TEXTS {
        println!("{}", warning.red().bold());
    }
    println!("{}", divider);
}

pub fn divider() -> ColoredString {
    "=".repeat(60).white()
}

pub fn step(msg: &str) {
    println!("{} {}", ">>".cyan().bold(), msg.bright_white());
}

pub fn ok(msg: &str) {
    println!("{} {}", "✔".green().bold(), msg.green());
}

pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg.yellow());
}

pub fn err(msg: &str) {
    eprintln!("{} {}", "[!]".red().bold(), msg.red());
}

pub fn confirm(msg: &str, default_yes: bool) -> bool {
    if default_yes {
        println!("{} [Y/n]", msg.cyan());
    } else {
        println!("{} [y/N]", msg.cyan());
    }
    let Ok(mut rl) = DefaultEditor::new() else {
        return default_yes;
    };
    match rl.readline("> ") {
        Ok(line) => parse_answer(&line, default_yes),
        Err(_) => false,
    }
}

/// Numbered pick from `items`; `None` on anything but a valid index.
pub fn choose(prompt: &str, items: &[String]) -> Option<usize> {
    println!("{}", divider());
    for (i, item) in items.iter().enumerate() {
        println!("{}{}", format!("{:>3}. ", i + 1).bright_cyan(), item);
    }
    println!("{}", divider());
    let mut rl = DefaultEditor::new().ok()?;
    let line = rl.readline(&format!("{}: ", prompt)).ok()?;
    match line.trim().parse::<usize>() {
        Ok(num) if num > 0 && num <= items.len() => Some(num - 1),
        _ => None,
    }
}

fn parse_answer(line: &str, default_yes: bool) -> bool {
    let line = line.trim().to_lowercase();
    if line.is_empty() {
        default_yes
    } else {
        line == "y" || line == "yes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("", true));
        assert!(!parse_answer("", false));
        assert!(parse_answer(" Y ", false));
        assert!(parse_answer("yes", false));
        assert!(!parse_answer("n", true));
    }
}
