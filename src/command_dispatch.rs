//! Purpose: Hold top-level CLI command dispatch for `cplrun`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command writes exactly one JSON document (or table) to stdout.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    context: &HostContext,
    _color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cplrun", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Versions => {
            emit_json(versions_json());
            Ok(RunOutcome::ok())
        }
        Command::List { json } => {
            let found = context.search.recipes(&context.registry);
            if !json && io::stdout().is_terminal() {
                let rows: Vec<Vec<String>> = found
                    .iter()
                    .map(|recipe| {
                        vec![
                            recipe.name.clone(),
                            recipe.version_string.clone(),
                            recipe.synopsis.clone(),
                            recipe.module.display().to_string(),
                        ]
                    })
                    .collect();
                emit_table(&["NAME", "VERSION", "SYNOPSIS", "MODULE"], &rows);
            } else {
                emit_json(json!({ "recipes": found }));
            }
            Ok(RunOutcome::ok())
        }
        Command::Info {
            recipe,
            module,
            version,
        } => {
            let handle = context.resolve_module(&recipe, module.as_deref(), version.as_deref())?;
            let bound = handle.find_plugin(&recipe)?;
            emit_json(recipe_info_json(&bound));
            Ok(RunOutcome::ok())
        }
        Command::Exec(args) => {
            let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
            let handle = context.resolve_module(
                &args.recipe,
                args.module.as_deref(),
                args.version.as_deref(),
            )?;
            let mut bound = handle.find_plugin(&args.recipe)?;
            let request = build_request(&args, &context.rc, &bound)?;
            let threshold = msg_threshold(&args, &context.rc)?;
            let result = execute(&mut bound, &request, timeout);
            let log = recipe_log(&args.recipe, &request, threshold);
            let envelope = result?;
            emit_json(exec_result_json(&args.recipe, &request, &envelope, &log));
            Ok(recipe_outcome(&envelope))
        }
    }
}
