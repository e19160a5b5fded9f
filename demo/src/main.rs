use std::process::ExitCode;

use bakery::{Environment, Recipe, Registry, Settings, Shell, TestSuite, files};
use camino::Utf8PathBuf;

fn main() -> ExitCode {
    let mut registry = Registry::new();

    registry.provide("submodules").run(|_| async {
        Ok(Shell::new("git submodule update --init --recursive")
            .named("submodules")
            .into_recipe())
    });

    registry.provide("temp").run(|_| async {
        Ok(Recipe::builder("temp")
            .output("test/temp")
            .action(|_, _| async {
                let path = Utf8PathBuf::from("test/temp");
                std::fs::create_dir_all(&path)?;
                Ok(path)
            }))
    });

    registry
        .provide("test_sources")
        .run(|_| async { Ok(files::glob("test/*.cpp")?) });

    registry
        .provide("headers")
        .run(|_| async { Ok(files::glob("include/moonlight/*.h")?) });

    // One executable per test source, rebuilt when the source or any header
    // is newer than it.
    registry
        .recipe("compile_test")
        .make(|_, (src, headers): &(Utf8PathBuf, Vec<Utf8PathBuf>)| {
            Ok(Shell::new("{CC} {CFLAGS} {src} {LDFLAGS} -o {output}")
                .arg("src", src)
                .output(files::drop_ext(src))
                .check(std::iter::once(src.clone()).chain(headers.iter().cloned()))
                .named("compile_test")
                .into_recipe())
        });

    registry
        .provide("tests")
        .depends_on(["submodules", "test_sources", "headers", "compile_test"])
        .run(|inputs| async move {
            let headers = inputs.paths("headers")?;
            let compile = inputs.factory("compile_test")?;

            inputs
                .paths("test_sources")?
                .into_iter()
                .map(|src| compile.make((src, headers.clone())))
                .collect::<anyhow::Result<Vec<_>>>()
        });

    registry
        .target("run_tests")
        .depends_on(["temp", "tests"])
        .default()
        .noclean()
        .run(|inputs| async move {
            let ctx = inputs.context();
            let settings = Settings::from_env(ctx.env())?;
            let suite = TestSuite::from_settings(&settings)
                .binaries(inputs.paths("tests")?)
                .cwd("test");

            match &settings.stress {
                Some(name) => {
                    suite
                        .stress(name, ctx)
                        .await
                        .ok_or_else(|| anyhow::anyhow!("No test named '{name}'"))??;
                }
                None => {
                    suite.run(ctx).await?;
                }
            }

            Ok(())
        });

    let env = Environment::builder()
        .default("CC", "clang++")
        .default(
            "CFLAGS",
            [
                "-g",
                "-I./include",
                "-I./deps/date/include",
                "--std=c++2a",
                "-DMOONLIGHT_DEBUG",
                "-DMOONLIGHT_ENABLE_STACKTRACE",
                "-DMOONLIGHT_STACKTRACE_IN_DESCRIPTION",
            ],
        )
        .default("LDFLAGS", ["-rdynamic", "-g", "-ldl", "-lpthread"])
        .default("INTERACTIVE", ["ansi"]);

    bakery::cli::main(registry, env)
}
