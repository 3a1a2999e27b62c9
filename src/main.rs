//! pulse - engagement analytics CLI
//!
//! Main entry point for the pulse command-line tool.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Read};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use pulse::api::{self, EventResponse, RankedEntity, RankedResponse, RecordEngagementEvent};
use pulse::config::span_from_secs;
use pulse::display::{DIVIDER_WIDTH, format_age, format_count, format_last_scored, format_score};
use pulse::*;

/// Resolved settings shared by every command.
struct Ctx {
    config: Config,
    format: OutputFormat,
    quiet: bool,
}

impl Ctx {
    const fn json(&self) -> bool {
        matches!(self.format, OutputFormat::Json | OutputFormat::JsonPretty)
    }

    fn engine(&self) -> Result<Engine> {
        let path = self.config.db_path();
        debug!(path = %path.display(), "opening engine");
        Engine::open(&self.config).with_context(|| format!("opening {}", path.display()))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            if let Some(hint) = err.downcast_ref::<PulseError>().and_then(PulseError::suggestion) {
                eprintln!("  {}", hint.dimmed());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    if !config.output.colors {
        colored::control::set_override(false);
    }
    logging::init_cli_logging(config.output.quiet, cli.verbose, config.output.colors);

    let format = match cli.format {
        Some(format) => format,
        None => config.output.format.parse()?,
    };
    let ctx = Ctx {
        quiet: config.output.quiet,
        config,
        format,
    };

    match &cli.command {
        Commands::Create(args) => cmd_create(&ctx, args),
        Commands::Record(args) => cmd_record(&ctx, args),
        Commands::Ingest(args) => cmd_ingest(&ctx, args),
        Commands::Show(args) => cmd_show(&ctx, args),
        Commands::Ranked(args) => cmd_ranked(&ctx, args),
        Commands::Stale(args) => cmd_stale(&ctx, args),
        Commands::Maintain(args) => cmd_maintain(&ctx, args),
        Commands::Cleanup(args) => cmd_cleanup(&ctx, args),
        Commands::Config(args) => cmd_config(&ctx, args),
        Commands::Completions(args) => {
            cmd_completions(args);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok());
            config
        }
        None => Config::load(),
    };

    if let Some(db) = &cli.db {
        config.paths.db = Some(db.clone());
    }
    if cli.quiet {
        config.output.quiet = true;
    }
    if cli.no_color {
        config.output.colors = false;
    }
    Ok(config)
}

fn print_json<T: Serialize>(ctx: &Ctx, value: &T) -> Result<()> {
    let json = if ctx.format == OutputFormat::JsonPretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

fn cmd_create(ctx: &Ctx, args: &cli::CreateArgs) -> Result<()> {
    let engine = ctx.engine()?;
    let key = EntityKey::new(args.kind, args.id.as_str());

    let mut entity = Entity::new(key, args.created_at.unwrap_or_else(Utc::now))
        .with_tags(args.tags.iter().cloned())
        .with_status(args.status);
    if let Some(community) = &args.community {
        entity = entity.with_community(community.as_str());
    }
    if let Some(author) = &args.author {
        entity = entity.with_author(author.as_str());
    }

    engine.create(&entity)?;
    engine.shutdown();

    if ctx.json() {
        print_json(ctx, &entity)?;
    } else if !ctx.quiet {
        println!("{} Created {}", "✓".green(), entity.key.to_string().bold());
    }
    Ok(())
}

fn cmd_record(ctx: &Ctx, args: &cli::RecordArgs) -> Result<()> {
    let event = EngagementEvent::with_payload(args.event, args.vote, args.reaction)?;
    let key = EntityKey::new(args.kind, args.id.as_str());
    let at = args.at.unwrap_or_else(Utc::now);

    let engine = ctx.engine()?;
    let outcome = engine
        .recorder()
        .record_at(&key, event, args.user.as_deref(), at)?;
    engine.shutdown();

    if ctx.json() {
        print_json(
            ctx,
            &serde_json::json!({
                "ok": true,
                "revision": outcome.revision,
                "firstSeen": outcome.first_seen,
                "memberCount": outcome.member_count,
            }),
        )?;
    } else if !ctx.quiet {
        println!(
            "{} Recorded {} on {} (revision {})",
            "✓".green(),
            event.event_type().to_string().cyan(),
            key.to_string().bold(),
            outcome.revision
        );
    }
    Ok(())
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    recorded: usize,
    rejected: usize,
    errors: Vec<IngestError>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestError {
    line: usize,
    error_kind: String,
    message: String,
}

fn cmd_ingest(ctx: &Ctx, args: &cli::IngestArgs) -> Result<()> {
    let reader: Box<dyn Read> = if args.path.as_os_str() == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(
            std::fs::File::open(&args.path)
                .map_err(|err| PulseError::path_error("open event file", &args.path, err))?,
        )
    };
    let lines: Vec<String> = BufReader::new(reader)
        .lines()
        .collect::<io::Result<_>>()
        .context("reading events")?;

    let engine = ctx.engine()?;
    let pb = if ctx.quiet || ctx.json() {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(lines.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let mut summary = IngestSummary::default();
    for (index, line) in lines.iter().enumerate() {
        pb.inc(1);
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let response = match serde_json::from_str::<RecordEngagementEvent>(line) {
            Ok(request) => api::record_engagement_event(engine.recorder(), &request),
            Err(err) => EventResponse::Error(api::ErrorBody {
                error_kind: "InvalidInput".to_string(),
                message: format!("malformed event: {err}"),
                retryable: false,
            }),
        };
        match response {
            EventResponse::Ok { .. } => summary.recorded += 1,
            EventResponse::Error(body) => {
                summary.rejected += 1;
                warn!(line = line_no, error = %body.message, "event rejected");
                if !args.keep_going {
                    pb.finish_and_clear();
                    engine.shutdown();
                    bail!("line {line_no}: {} ({})", body.message, body.error_kind);
                }
                summary.errors.push(IngestError {
                    line: line_no,
                    error_kind: body.error_kind,
                    message: body.message,
                });
            }
        }
    }
    pb.finish_and_clear();
    engine.shutdown();

    if ctx.json() {
        print_json(ctx, &summary)?;
    } else if !ctx.quiet {
        println!(
            "{} Recorded {} events",
            "✓".green(),
            format_count(summary.recorded as u64).cyan()
        );
        if summary.rejected > 0 {
            println!(
                "{} Rejected {} events",
                "!".yellow(),
                format_count(summary.rejected as u64).yellow()
            );
            for error in summary.errors.iter().take(10) {
                println!("  line {}: {}", error.line, error.message.dimmed());
            }
        }
    }
    Ok(())
}

fn cmd_show(ctx: &Ctx, args: &cli::ShowArgs) -> Result<()> {
    let engine = ctx.engine()?;
    let entity = engine.entity(&EntityKey::new(args.kind, args.id.as_str()))?;
    engine.shutdown();

    if ctx.json() {
        return print_json(ctx, &entity);
    }

    let analytics = entity.analytics();
    let counters = analytics.counters();
    println!("{}", entity.key.to_string().bold().cyan());
    println!("{}", "─".repeat(DIVIDER_WIDTH));
    println!("  {:<18} {}", "Status:", entity.status.as_str());
    if let Some(community) = &entity.community_id {
        println!("  {:<18} {}", "Community:", community);
    }
    if let Some(author) = &entity.author_id {
        println!("  {:<18} {}", "Author:", author);
    }
    if !entity.tags.is_empty() {
        println!("  {:<18} {}", "Tags:", entity.tags.join(", ").blue());
    }
    println!(
        "  {:<18} {}",
        "Created:",
        format_age(analytics.created_at())
    );
    println!(
        "  {:<18} {}",
        "Last activity:",
        format_age(analytics.last_activity_at())
    );
    println!(
        "  {:<18} {} (revision {}/{})",
        "Last scored:",
        format_last_scored(analytics.last_score_update_at()),
        analytics.scored_revision(),
        analytics.revision()
    );
    if analytics.is_pruned() {
        println!("  {}", "Window data pruned".yellow());
    }

    println!();
    println!("{}", "Counters".bold());
    for (label, value) in [
        ("Views", counters.total_views),
        ("Unique views", counters.unique_views),
        ("Upvotes", counters.total_upvotes),
        ("Downvotes", counters.total_downvotes),
        ("Comments", counters.total_comments),
        ("Shares", counters.total_shares),
        ("Saves", counters.total_saves),
        ("Reports", counters.total_reports),
        ("Clicks", counters.total_clicks),
        ("Reactions", counters.total_reactions),
        ("Unique engagers", counters.unique_engagers),
    ] {
        println!("  {label:<18} {:>12}", format_count(value));
    }

    if let Some(stats) = analytics.community() {
        println!();
        println!("{}", "Community".bold());
        println!("  {:<18} {:>12}", "Members", format_count(stats.member_count));
        println!(
            "  {:<18} {:>12}",
            "Active this week",
            format_count(stats.active_members_week)
        );
        println!("  {:<18} {:>12}", "Posts", format_count(stats.post_count));
        println!("  {:<18} {:>12}", "Growth rate", format_score(stats.growth_rate));
    }

    println!();
    println!("{}", "Scores".bold());
    let scores = analytics.scores();
    for field in ScoreField::ALL {
        println!(
            "  {:<18} {:>12}",
            field.as_str(),
            format_score(scores.get(field))
        );
    }
    Ok(())
}

fn build_scope(args: &cli::RankedArgs) -> Scope {
    Scope {
        community_id: args.community.clone(),
        author_id: args.author.clone(),
        tags: args.tags.clone(),
        created_after: args.since,
        created_before: args.until,
    }
}

fn cmd_ranked(ctx: &Ctx, args: &cli::RankedArgs) -> Result<()> {
    let engine = ctx.engine()?;
    let entities = engine.ranking().top_by_score(
        args.kind,
        &build_scope(args),
        args.by,
        args.order,
        args.limit,
    )?;
    engine.shutdown();

    if ctx.json() {
        let response = RankedResponse {
            entities: entities
                .iter()
                .map(|entity| RankedEntity::from_entity(entity, args.by))
                .collect(),
        };
        return print_json(ctx, &response);
    }

    if entities.is_empty() {
        println!("{}", "No entities found.".yellow());
        return Ok(());
    }
    println!(
        "{} by {}:\n",
        format!("Top {} {}", entities.len(), args.kind).bold(),
        args.by.as_str().cyan()
    );
    for (rank, entity) in entities.iter().enumerate() {
        let analytics = entity.analytics();
        let counters = analytics.counters();
        println!(
            "{:>3}. {:<32} {:>12}  {} {}  {} {}  {}",
            rank + 1,
            entity.key.id.bold(),
            format_score(analytics.scores().get(args.by)).cyan(),
            "▲".green(),
            counters.total_upvotes,
            "▼".red(),
            counters.total_downvotes,
            format_age(analytics.last_activity_at()).dimmed()
        );
    }
    Ok(())
}

fn cmd_stale(ctx: &Ctx, args: &cli::StaleArgs) -> Result<()> {
    let maintenance = &ctx.config.maintenance;
    let lookback = args
        .lookback_secs
        .map_or_else(|| maintenance.activity_lookback(), span_from_secs);
    let limit = args.limit.unwrap_or(maintenance.batch_cap);
    let now = Utc::now();

    let engine = ctx.engine()?;
    let entities = engine
        .ranking()
        .entities_requiring_score_update(now - lookback, limit, now)?;
    engine.shutdown();

    if ctx.json() {
        let keys: Vec<String> = entities.iter().map(|e| e.key.to_string()).collect();
        return print_json(ctx, &keys);
    }
    if entities.is_empty() {
        println!("{}", "All scores are fresh.".green());
        return Ok(());
    }
    for entity in &entities {
        let analytics = entity.analytics();
        println!(
            "  {:<40} active {:<12} scored {}",
            entity.key.to_string(),
            format_age(analytics.last_activity_at()),
            format_last_scored(analytics.last_score_update_at()).dimmed()
        );
    }
    Ok(())
}

fn print_report(ctx: &Ctx, report: &MaintenanceReport) -> Result<()> {
    if ctx.json() {
        return print_json(ctx, report);
    }
    if ctx.quiet {
        return Ok(());
    }
    println!(
        "{} rotated {} windows, refreshed {}/{}, superseded {}, deferred {} ({} ms)",
        "✓".green(),
        report.rotated,
        report.refreshed,
        report.selected,
        report.superseded,
        report.skipped,
        report.duration_ms
    );
    if let Some(pruned) = report.pruned {
        println!("  pruned {pruned} entities");
    }
    for failure in &report.failures {
        println!(
            "  {} {}: {}",
            "✗".red(),
            failure.entity,
            failure.message.dimmed()
        );
    }
    Ok(())
}

fn cmd_maintain(ctx: &Ctx, args: &cli::MaintainArgs) -> Result<()> {
    let engine = ctx.engine()?;
    let job = Arc::clone(engine.maintenance());

    let report = job.run_once(Utc::now())?;
    print_report(ctx, &report)?;

    if !args.watch {
        engine.shutdown();
        if let Some(err) = report.failure_error() {
            return Err(err.into());
        }
        return Ok(());
    }

    let interval = args
        .interval_secs
        .map_or_else(|| ctx.config.maintenance.interval(), Duration::from_secs);
    if interval.is_zero() {
        bail!("watch interval must be at least one second");
    }
    let handle = job.spawn(interval)?;
    if !ctx.quiet && !ctx.json() {
        println!(
            "Watching: maintenance every {}s (Ctrl-C to stop)",
            interval.as_secs()
        );
    }

    if let Some(secs) = args.duration_secs {
        std::thread::sleep(Duration::from_secs(secs));
        let runs = handle.stop();
        engine.shutdown();
        if !ctx.quiet && !ctx.json() {
            println!("{} {} scheduled runs", "✓".green(), runs);
        }
        return Ok(());
    }
    loop {
        std::thread::park();
    }
}

fn cmd_cleanup(ctx: &Ctx, args: &cli::CleanupArgs) -> Result<()> {
    let days = args
        .older_than_days
        .or(ctx.config.maintenance.cleanup_older_than_days)
        .context(
            "no retention given: pass --older-than-days or set maintenance.cleanup_older_than_days",
        )?;

    let engine = ctx.engine()?;
    let pruned = engine.ranking().cleanup_old_analytics(days, Utc::now())?;
    engine.shutdown();

    if ctx.json() {
        print_json(ctx, &serde_json::json!({ "pruned": pruned, "olderThanDays": days }))?;
    } else if !ctx.quiet {
        println!(
            "{} Pruned window data of {} entities older than {} days",
            "✓".green(),
            format_count(pruned as u64).cyan(),
            days
        );
    }
    Ok(())
}

fn cmd_config(ctx: &Ctx, args: &cli::ConfigArgs) -> Result<()> {
    if args.path {
        let path = Config::user_config_path().context("no config directory on this system")?;
        println!("{}", path.display());
        return Ok(());
    }

    if args.init {
        let path = Config::user_config_path().context("no config directory on this system")?;
        if path.exists() {
            bail!("config file already exists at {}", path.display());
        }
        Config::default().write_to(&path)?;
        if !ctx.quiet {
            println!("{} Wrote {}", "✓".green(), path.display());
        }
        return Ok(());
    }

    if ctx.json() {
        return print_json(ctx, &ctx.config);
    }
    println!("{}", "Current Configuration".bold().cyan());
    println!("  {:<24} {}", "Database:", ctx.config.db_path().display());
    print!("{}", toml::to_string_pretty(&ctx.config)?);
    Ok(())
}

fn cmd_completions(args: &cli::CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "pulse", &mut io::stdout());
}
