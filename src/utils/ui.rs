use crate::core::models::{BuildResult, Manifest};
use crate::utils::BuildFailure;
use colored::*;

/// Terminal output for the CLI.
pub struct SokuUI;

impl SokuUI {
    pub fn banner() {
        println!(
            "\n  {} {}",
            "SOKU".bright_cyan().bold(),
            concat!("v", env!("CARGO_PKG_VERSION")).bright_white()
        );
        println!();
    }

    fn format_size(size: usize) -> String {
        let size_kb = size as f64 / 1024.0;
        if size_kb < 1.0 {
            format!("{} B", size)
        } else {
            format!("{:.2} kB", size_kb)
        }
    }

    pub fn show_completion(outdir: &str, result: &BuildResult) {
        println!();
        for file in &result.output_files {
            println!(
                "  {} {} {}",
                format!("{}/", outdir).bright_black(),
                file.name.bright_cyan(),
                format!("({})", Self::format_size(file.size)).bright_black()
            );
        }

        for warning in &result.warnings {
            println!("  {} {}", "⚠".bright_yellow(), warning);
        }

        let stats = &result.stats;
        println!();
        println!(
            "  {} {} modules ({} transformed, {} cached), {} chunks",
            "•".bright_black(),
            stats.modules_total.to_string().bright_white(),
            stats.modules_transformed,
            stats.cache_hits,
            stats.chunks_total
        );
        println!(
            "  {} built in {}",
            "✓".bright_green(),
            format!("{:.0}ms", stats.duration.as_secs_f64() * 1000.0)
                .bright_white()
                .bold()
        );
    }

    pub fn show_failure(failure: &BuildFailure) {
        eprintln!();
        eprintln!(
            "  {} build failed with {} error(s)",
            "✗".bright_red(),
            failure.len().to_string().bright_red().bold()
        );
        for (module, errors) in failure.grouped() {
            eprintln!("  {}", module.unwrap_or("<build>").bright_white().bold());
            for error in errors {
                eprintln!("    {} {}", "-".bright_red(), error);
            }
        }
    }

    pub fn show_manifest(manifest: &Manifest) {
        println!();
        for (entry, files) in &manifest.entries {
            println!("  {}", entry.bright_cyan().bold());
            for file in files {
                println!("    {}", file);
            }
        }
        println!();
        for (name, chunk) in &manifest.chunks {
            println!(
                "  {} {} {} module(s){}",
                format!("{:?}", chunk.kind).to_lowercase().bright_black(),
                name.bright_white(),
                chunk.modules.len(),
                if chunk.retains_runtime_imports {
                    " (runtime imports)".bright_yellow().to_string()
                } else {
                    String::new()
                }
            );
        }
    }
}
