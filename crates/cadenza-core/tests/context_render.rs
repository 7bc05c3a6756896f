//! End-to-end rendering through `AudioContext`: the render driver, source
//! scheduling, live input, automatic pull, staged resource loading and
//! context shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use cadenza_core::nodes::{
    ConstantSourceNode, ConvolverNode, GainNode, ImpulseResponse, LiveInputNode, PowerMonitorNode,
};
use cadenza_core::{
    AsyncLoader, AudioBus, AudioContext, ContextConfig, GraphError, LoadError, PlaybackState,
    ScheduledSource,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

fn context(config: ContextConfig) -> AudioContext {
    init_tracing();
    AudioContext::new(config).expect("valid config")
}

fn render(ctx: &AudioContext) -> AudioBus {
    let config = ctx.config();
    let mut out = AudioBus::new(config.output_channels, config.quantum_frames);
    ctx.render(None, &mut out, config.quantum_frames);
    out
}

#[test]
fn gain_doubles_constant_source_every_quantum() {
    let ctx = context(ContextConfig::default());
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let gain = ctx.create_node(GainNode::new(2.0)).expect("gain");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&source, 0, &gain, 0).expect("connect");
        g.connect(&gain, 0, &dest, 0).expect("connect");
    }

    for quantum in 1..=8_u64 {
        let out = render(&ctx);
        assert_eq!(out.number_of_channels(), 2);
        for channel in out.channels() {
            assert!(channel.iter().all(|&s| s == 2.0));
        }
        assert_eq!(ctx.current_sample_frame(), quantum * 128);
    }
    assert_eq!(ctx.silent_render_count(), 0);
}

#[test]
fn finished_source_is_disabled_and_then_collected() {
    let ctx = context(ContextConfig {
        sample_rate: 8000.0,
        quantum_frames: 8,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(1.0);
    let schedule = Arc::clone(constant.schedule());
    schedule.start(0.0).expect("start");
    schedule.stop(0.001).expect("stop");
    let source = ctx.create_node(constant).expect("source");
    let dest = ctx.destination();
    ctx.graph_lock()
        .connect(&source, 0, &dest, 0)
        .expect("connect");

    let out = render(&ctx);
    assert!(out.channel(0).iter().all(|&s| s == 1.0));
    assert_eq!(schedule.state(), PlaybackState::Playing);

    let out = render(&ctx);
    assert_eq!(out.max_abs_value(), 0.0);
    assert_eq!(schedule.state(), PlaybackState::Finished);

    let output = Arc::clone(source.output(0).expect("output"));
    let junction = dest.input(0).expect("input").junction();
    assert!(junction.is_disabled(&output));
    assert_eq!(output.rendering_fan_out_count(), 0);

    drop(source);
    ctx.collect_garbage();
    assert_eq!(ctx.node_count(), 1);
    assert_eq!(junction.number_of_connections(), 0);
}

#[test]
fn delayed_start_offsets_within_quantum() {
    let ctx = context(ContextConfig {
        sample_rate: 1000.0,
        quantum_frames: 8,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(0.5);
    constant.start(0.004).expect("start");
    assert!(matches!(constant.start(0.0), Err(GraphError::InvalidState(_))));
    let source = ctx.create_node(constant).expect("source");
    ctx.graph_lock()
        .connect(&source, 0, &ctx.destination(), 0)
        .expect("connect");

    let out = render(&ctx);
    assert_eq!(&out.channel(0)[..4], &[0.0; 4]);
    assert_eq!(&out.channel(0)[4..], &[0.5; 4]);
}

#[test]
fn live_input_reaches_destination() {
    let ctx = context(ContextConfig {
        quantum_frames: 32,
        output_channels: 2,
        input_channels: 2,
        ..ContextConfig::default()
    });
    let live = ctx.create_node(LiveInputNode::new(2)).expect("live");
    let gain = ctx.create_node(GainNode::new(0.5)).expect("gain");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&live, 0, &gain, 0).expect("connect");
        g.connect(&gain, 0, &dest, 0).expect("connect");
    }

    let mut mic = AudioBus::new(2, 32);
    mic.channel_mut(0).fill(1.0);
    mic.channel_mut(1).fill(-1.0);
    mic.set_silent(false);
    let mut out = AudioBus::new(2, 32);
    ctx.render(Some(&mic), &mut out, 32);
    assert!(out.channel(0).iter().all(|&s| s == 0.5));
    assert!(out.channel(1).iter().all(|&s| s == -0.5));

    ctx.render(None, &mut out, 32);
    assert_eq!(out.max_abs_value(), 0.0);
}

#[test]
fn mono_live_input_written_in_place_reaches_stereo_destination() {
    let ctx = context(ContextConfig {
        quantum_frames: 16,
        output_channels: 2,
        input_channels: 1,
        ..ContextConfig::default()
    });
    let live = ctx.create_node(LiveInputNode::new(2)).expect("live");
    ctx.graph_lock()
        .connect(&live, 0, &ctx.destination(), 0)
        .expect("connect");

    // Filled through the sample accessor only; the silence flag is never touched.
    let mut mic = AudioBus::new(1, 16);
    mic.channel_mut(0).fill(0.5);
    let mut out = AudioBus::new(2, 16);
    ctx.render(Some(&mic), &mut out, 16);
    for channel in out.channels() {
        assert!(channel.iter().all(|&s| s == 0.5));
    }
}

#[test]
fn power_monitor_is_pulled_without_consumers() {
    let ctx = context(ContextConfig {
        quantum_frames: 128,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(0.5);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let monitor = PowerMonitorNode::new();
    let meter = monitor.meter();
    let monitor = ctx.create_node(monitor).expect("monitor");
    ctx.graph_lock()
        .connect(&source, 0, &monitor, 0)
        .expect("connect");

    assert_eq!(meter.db(), 0.0);
    let out = render(&ctx);
    assert_eq!(out.max_abs_value(), 0.0);
    assert!((meter.db() - 20.0 * 0.5_f32.log10()).abs() < 1e-3);
    assert_eq!(monitor.last_processed_quantum(), Some(1));

    monitor.reset(&ctx.graph_lock());
    assert!(monitor.is_reset_pending());
    render(&ctx);
    assert!(!monitor.is_reset_pending());
    assert_eq!(monitor.last_processed_quantum(), Some(2));
}

#[test]
fn control_side_queries_never_cost_a_quantum() {
    let ctx = context(ContextConfig {
        quantum_frames: 32,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let gain = ctx.create_node(GainNode::new(1.0)).expect("gain");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&source, 0, &gain, 0).expect("connect");
        g.connect(&gain, 0, &dest, 0).expect("connect");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let gain = gain.clone();
        let ctx = ctx.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut polls = 0_u64;
            while !stop.load(Ordering::Acquire) {
                assert_eq!(gain.tail_time(), 0.0);
                assert_eq!(gain.latency_time(), 0.0);
                let _ = gain.propagates_silence(ctx.current_time());
                gain.reset(&ctx.graph_lock());
                polls += 1;
            }
            polls
        })
    };

    for _ in 0..2000 {
        let out = render(&ctx);
        assert!(out.channel(0).iter().all(|&s| s == 1.0), "render lost a quantum");
    }
    stop.store(true, Ordering::Release);
    assert!(poller.join().expect("poller") > 0);
    assert_eq!(ctx.silent_render_count(), 0);
}

#[test]
fn convolver_swaps_in_loaded_response() {
    let ctx = context(ContextConfig {
        quantum_frames: 8,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let convolver = ConvolverNode::new();
    let control = convolver.control();
    control.set_normalize(false);
    let convolver = ctx.create_node(convolver).expect("convolver");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&source, 0, &convolver, 0).expect("connect");
        g.connect(&convolver, 0, &dest, 0).expect("connect");
    }

    // No response yet: pass-through.
    let out = render(&ctx);
    assert!(out.channel(0).iter().all(|&s| s == 1.0));

    let loader = Arc::new(AsyncLoader::spawn("one-sample-delay", || {
        ImpulseResponse::new(vec![vec![0.0, 1.0]], 44100.0)
    }));
    control.load(&loader);
    loader.wait().expect("loaded");
    assert!(!control.is_loading());

    let out = render(&ctx);
    assert_eq!(out.channel(0)[0], 0.0);
    assert!(out.channel(0)[1..].iter().all(|&s| s == 1.0));
    let out = render(&ctx);
    assert!(out.channel(0).iter().all(|&s| s == 1.0));
    assert!((convolver.tail_time() - 2.0 / 44100.0).abs() < 1e-12);
}

#[test]
fn convolver_delays_past_the_first_partition() {
    let ctx = context(ContextConfig {
        quantum_frames: 128,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let convolver = ConvolverNode::new();
    let control = convolver.control();
    control.set_normalize(false);
    let mut delay = vec![0.0; 301];
    delay[300] = 1.0;
    control.set_impulse_response(ImpulseResponse::new(vec![delay], 44100.0).expect("ir"));
    let convolver = ctx.create_node(convolver).expect("convolver");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&source, 0, &convolver, 0).expect("connect");
        g.connect(&convolver, 0, &dest, 0).expect("connect");
    }

    let mut rendered = Vec::new();
    for _ in 0..4 {
        rendered.extend_from_slice(render(&ctx).channel(0));
    }
    assert!(rendered[..300].iter().all(|s| s.abs() < 1e-4));
    assert!(rendered[300..].iter().all(|s| (s - 1.0).abs() < 1e-4));
}

#[test]
fn convolver_reports_failed_load_and_keeps_passing_through() {
    let ctx = context(ContextConfig {
        quantum_frames: 8,
        output_channels: 1,
        ..ContextConfig::default()
    });
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let convolver = ConvolverNode::new();
    let control = convolver.control();
    let convolver = ctx.create_node(convolver).expect("convolver");
    {
        let dest = ctx.destination();
        let mut g = ctx.graph_lock();
        g.connect(&source, 0, &convolver, 0).expect("connect");
        g.connect(&convolver, 0, &dest, 0).expect("connect");
    }

    let loader = AsyncLoader::shared("context-render-missing-ir", || {
        ImpulseResponse::new(Vec::new(), 44100.0)
    });
    control.load(&loader);
    assert!(loader.wait().is_err());
    assert!(matches!(control.load_error(), Some(LoadError::Failed { .. })));

    let out = render(&ctx);
    assert!(out.channel(0).iter().all(|&s| s == 1.0));
}

#[test]
fn stop_tears_down_graph_and_silences_output() {
    let ctx = context(ContextConfig::default());
    let constant = ConstantSourceNode::new(1.0);
    constant.start(0.0).expect("start");
    let source = ctx.create_node(constant).expect("source");
    let dest = ctx.destination();
    ctx.graph_lock()
        .connect(&source, 0, &dest, 0)
        .expect("connect");
    assert!(render(&ctx).max_abs_value() > 0.0);

    ctx.stop();
    assert!(!ctx.is_running());
    assert_eq!(ctx.node_count(), 1);
    assert!(!source.is_initialized());
    assert_eq!(
        dest.input(0).map(|i| i.number_of_connections()),
        Some(0)
    );
    assert_eq!(render(&ctx).max_abs_value(), 0.0);
    assert_eq!(ctx.silent_render_count(), 1);
    assert_eq!(
        ctx.graph_lock().connect(&source, 0, &dest, 0),
        Err(GraphError::NodeNotFound(source.id()))
    );
    assert_eq!(
        ctx.create_node(GainNode::default()).map(|_| ()),
        Err(GraphError::ContextClosed)
    );
}

#[cfg(feature = "serde")]
#[test]
fn context_from_toml() {
    let config = ContextConfig::from_toml_str("sample_rate = 48000.0\nquantum_frames = 256\n")
        .expect("parse");
    let ctx = context(config);
    assert_eq!(ctx.sample_rate(), 48000.0);
    assert_eq!(ctx.config().output_channels, 2);
}
